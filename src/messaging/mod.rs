pub mod ack;
pub mod mailbox;
pub mod message;
pub mod peer;
pub mod reliable;
pub mod transport;
