pub mod commands;
pub mod responses;
pub mod slideshow;
