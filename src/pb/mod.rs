//! Generated gRPC types for the control-plane service (§6, §4.G/§4.H),
//! compiled at build time by `build.rs` from `proto/probe_agent.proto`.

tonic::include_proto!("probe_agent");
