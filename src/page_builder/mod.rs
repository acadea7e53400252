pub mod image_utils;
pub mod layout;
pub mod pdf_writer;
