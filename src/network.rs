pub mod circuit;
pub mod circuit_socket;
pub mod network_events;
pub mod network_manager;
pub mod packet_queue;
pub mod packet_registry;
pub mod session;
pub mod udp;
