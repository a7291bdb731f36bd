pub(crate) mod frame_store;
pub(crate) mod tracker;
