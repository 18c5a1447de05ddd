pub mod address;
pub mod alt_sign_addr;
pub mod hash;
pub mod network;
pub mod request;
pub mod ticket;
pub mod tx;
pub mod vote_change;
