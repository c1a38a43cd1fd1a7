//! Agent gateway: tracks connected host agents, tunnels browser terminal
//! sessions onto agent byte streams and fans out host telemetry.

pub mod gateway;
