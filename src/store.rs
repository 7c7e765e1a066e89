pub mod dao;
pub(crate) mod models;
