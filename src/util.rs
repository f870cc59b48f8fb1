pub mod kmeans;
pub(crate) mod retry;
pub mod text;
