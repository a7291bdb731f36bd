pub(crate) mod compositor;
pub(crate) mod pool;
pub(crate) mod raster;
