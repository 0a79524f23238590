pub mod account;
pub mod info;
pub mod recover;
pub mod sql;
