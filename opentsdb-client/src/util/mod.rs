pub mod lines;
pub mod localhost;
pub mod spinlock;
