pub mod datagram;
pub mod host;
pub mod message;
pub mod perfect_link;
pub mod receiver;
pub mod send_socket;
pub mod sender;
pub mod store;
pub mod throughput_monitor;
pub mod transmission;
