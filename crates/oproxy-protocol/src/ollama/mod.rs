pub mod chat;
pub mod embed;
pub mod generate;
pub mod tags;
