//! Generic request-response codec for Serde types using raw JSON.
//!
//! Raw JSON does not include a length prefix, so to solve the framing
//! problem we repeatedly try parsing and read more content into the buffer
//! until it succeeds (see [`read_json`]).

use crate::prelude::*;
use crate::utils::read_json;
use libp2p::{request_response, StreamProtocol};
use std::io;
use std::marker::PhantomData;

pub struct JsonCodec<Request, Response> {
    request: PhantomData<Request>,
    response: PhantomData<Response>,
}

impl<Request, Response> Default for JsonCodec<Request, Response> {
    fn default() -> Self {
        Self {
            request: PhantomData,
            response: PhantomData,
        }
    }
}

impl<Request, Response> Clone for JsonCodec<Request, Response> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

#[async_trait]
impl<Request, Response> request_response::Codec for JsonCodec<Request, Response>
where
    Request: Send + Sync + Serialize + for<'a> Deserialize<'a>,
    Response: Send + Sync + Serialize + for<'a> Deserialize<'a>,
{
    type Protocol = StreamProtocol;
    type Request = Request;
    type Response = Response;

    async fn read_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_json::<_, Request>(io).await
    }

    async fn read_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_json::<_, Response>(io).await
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.write_all(serde_json::to_vec(&req)?.as_slice()).await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.write_all(serde_json::to_vec(&res)?.as_slice()).await
    }
}
