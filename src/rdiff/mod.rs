pub mod command;
pub mod filelist;
pub mod increments;
pub mod quote;
