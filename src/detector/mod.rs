pub mod deadlock;
