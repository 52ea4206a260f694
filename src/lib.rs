pub mod banning;
pub mod bus;
pub mod config;
pub mod daemon;
pub mod error;
pub mod family;
pub mod jobs;
pub mod pool;
pub mod shares;
pub mod stratum;
pub mod vardiff;
