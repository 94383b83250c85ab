pub mod backup;
pub mod inventory;
pub mod restore;
