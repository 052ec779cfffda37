pub mod mailbox;
pub mod message_buffer;
pub mod readiness;
pub mod sender_receiver_proxy;
