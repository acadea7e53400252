pub mod media_fetch;
