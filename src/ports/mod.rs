pub mod clock;
pub mod database;
pub mod directory;
pub mod membership;
