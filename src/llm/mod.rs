pub mod chat;
pub mod diary;
pub mod sanitize;
pub mod stream;
