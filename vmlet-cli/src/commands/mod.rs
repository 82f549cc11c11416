pub mod add;
pub mod get;
pub mod ping;
pub mod recover;
pub mod release;
