//! Generated protobuf/gRPC types for the `c2.v1` service, shared by
//! `c2-server` and `c2-agent`.

pub mod gen {
    pub mod c2 {
        pub mod v1 {
            tonic::include_proto!("c2.v1");
        }
    }
}
