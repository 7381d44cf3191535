//! Wire types and client stub for `backend.DataService`.
//!
//! Equivalent to what `tonic-build` emits for:
//!
//! ```proto
//! package backend;
//! message Data { int64 id = 1; string token = 2; bytes body = 3; }
//! message Request { Data data = 1; }
//! message Response { bytes payload = 1; string content_type = 2; }
//! service DataService { rpc GetData(Request) returns (Response); }
//! ```

use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(string, tag = "2")]
    pub token: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "3")]
    pub body: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(message, optional, tag = "1")]
    pub data: ::core::option::Option<Data>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub content_type: ::prost::alloc::string::String,
}

pub const GET_DATA_PATH: &str = "/backend.DataService/GetData";

/// Unary client for `backend.DataService`.
#[derive(Debug, Clone)]
pub struct DataServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl DataServiceClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn get_data(
        &mut self,
        request: tonic::Request<Request>,
    ) -> Result<tonic::Response<Response>, tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::unavailable(format!("backend channel not ready: {e}"))
        })?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(GET_DATA_PATH);
        self.inner.unary(request, path, codec).await
    }
}
