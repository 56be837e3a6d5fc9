pub mod accessibility;
pub mod chunked_join;
