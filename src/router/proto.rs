// ============================================================================
// canvas.router wire types and gRPC glue
// ============================================================================
//
// service MessageRouter { rpc Deliver(DeliverRequest) returns (DeliverResponse); }
//
// Written out by hand in the shape tonic's code generator produces, so the
// crate builds without protoc. Tags are wire contract.
//
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeliverRequest {
    #[prost(oneof = "deliver_request::Target", tags = "1, 2")]
    pub target: Option<deliver_request::Target>,
    #[prost(message, optional, tag = "3")]
    pub message: Option<MessagePayload>,
}

pub mod deliver_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Target {
        #[prost(int64, tag = "1")]
        ConnectionId(i64),
        #[prost(string, tag = "2")]
        UserName(String),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MessagePayload {
    #[prost(oneof = "message_payload::Content", tags = "1")]
    pub content: Option<message_payload::Content>,
}

pub mod message_payload {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Content {
        #[prost(string, tag = "1")]
        Text(String),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeliverResponse {
    #[prost(oneof = "deliver_response::Outcome", tags = "1, 2")]
    pub outcome: Option<deliver_response::Outcome>,
}

pub mod deliver_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Outcome {
        #[prost(bool, tag = "1")]
        Success(bool),
        #[prost(message, tag = "2")]
        Error(super::DeliveryFailure),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeliveryFailure {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unspecified = 0,
    NotFound = 1,
    Undefined = 2,
}

impl DeliverResponse {
    pub fn success() -> Self {
        Self {
            outcome: Some(deliver_response::Outcome::Success(true)),
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            outcome: Some(deliver_response::Outcome::Error(DeliveryFailure {
                code: code as i32,
                message: message.into(),
            })),
        }
    }
}

pub const SERVICE_NAME: &str = "canvas.router.MessageRouter";

pub mod message_router_client {
    #![allow(clippy::wildcard_imports)]
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct MessageRouterClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl<T> MessageRouterClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::Body>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn new(inner: T) -> Self {
            Self {
                inner: tonic::client::Grpc::new(inner),
            }
        }

        pub async fn deliver(
            &mut self,
            request: impl tonic::IntoRequest<super::DeliverRequest>,
        ) -> Result<tonic::Response<super::DeliverResponse>, tonic::Status> {
            self.inner
                .ready()
                .await
                .map_err(|e| tonic::Status::unavailable(format!("Service was not ready: {}", e.into())))?;
            let codec = tonic_prost::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/canvas.router.MessageRouter/Deliver");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new(super::SERVICE_NAME, "Deliver"));
            self.inner.unary(req, path, codec).await
        }
    }
}

pub mod message_router_server {
    #![allow(clippy::wildcard_imports)]
    use tonic::codegen::*;

    #[async_trait]
    pub trait MessageRouter: std::marker::Send + std::marker::Sync + 'static {
        async fn deliver(
            &self,
            request: tonic::Request<super::DeliverRequest>,
        ) -> Result<tonic::Response<super::DeliverResponse>, tonic::Status>;
    }

    pub struct MessageRouterServer<T> {
        inner: Arc<T>,
    }

    impl<T> MessageRouterServer<T> {
        pub fn new(inner: T) -> Self {
            Self::from_arc(Arc::new(inner))
        }

        pub fn from_arc(inner: Arc<T>) -> Self {
            Self { inner }
        }
    }

    impl<T> Clone for MessageRouterServer<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }

    impl<T, B> tonic::codegen::Service<http::Request<B>> for MessageRouterServer<T>
    where
        T: MessageRouter,
        B: Body + std::marker::Send + 'static,
        B::Error: Into<StdError> + std::marker::Send + 'static,
    {
        type Response = http::Response<tonic::body::Body>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                "/canvas.router.MessageRouter/Deliver" => {
                    struct DeliverSvc<T: MessageRouter>(pub Arc<T>);

                    impl<T: MessageRouter> tonic::server::UnaryService<super::DeliverRequest> for DeliverSvc<T> {
                        type Response = super::DeliverResponse;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

                        fn call(&mut self, request: tonic::Request<super::DeliverRequest>) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            Box::pin(async move { <T as MessageRouter>::deliver(&inner, request).await })
                        }
                    }

                    let inner = self.inner.clone();
                    Box::pin(async move {
                        let codec = tonic_prost::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec);
                        Ok(grpc.unary(DeliverSvc(inner), req).await)
                    })
                }
                _ => Box::pin(async move {
                    let mut response = http::Response::new(tonic::body::Body::default());
                    let headers = response.headers_mut();
                    headers.insert(
                        tonic::Status::GRPC_STATUS,
                        (tonic::Code::Unimplemented as i32).into(),
                    );
                    headers.insert(http::header::CONTENT_TYPE, tonic::metadata::GRPC_CONTENT_TYPE);
                    Ok(response)
                }),
            }
        }
    }

    impl<T> tonic::server::NamedService for MessageRouterServer<T> {
        const NAME: &'static str = super::SERVICE_NAME;
    }
}
