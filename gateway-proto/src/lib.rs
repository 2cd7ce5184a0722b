//! Generated bindings for the schema catalog streaming RPC (spec §6).

tonic::include_proto!("gateway.catalog.v1");
