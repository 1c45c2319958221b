//! Contract between the DoH handler and the DNS resolution pipeline.
//!
//! The pipeline receives the decoded query together with a [`ResponseCapture`]
//! and is expected to write exactly one response message into it.

use std::{fmt, net::SocketAddr, time::Duration};

use anyhow::{Context, Result, anyhow};
use axum::http::header;
use futures_util::future::BoxFuture;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::opt::EdnsCode;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::PipelineSection;
use crate::doh::DNS_CONTENT_TYPE;

/// Turns a decoded DNS query into a response written to `writer`.
pub trait DnsPipeline: Send + Sync {
    fn serve_dns<'a>(
        &'a self,
        request: &'a Message,
        writer: &'a mut ResponseCapture,
    ) -> BoxFuture<'a, ()>;
}

/// Returned when a pipeline writes more than one message for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyWritten;

impl fmt::Display for AlreadyWritten {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a response message was already written for this request")
    }
}

impl std::error::Error for AlreadyWritten {}

/// Holds the single response message produced for one DoH request, plus the
/// addresses observed on the connection that carried it.
#[derive(Debug)]
pub struct ResponseCapture {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    message: Option<Message>,
}

impl ResponseCapture {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            remote_addr,
            message: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn write_message(&mut self, message: Message) -> Result<(), AlreadyWritten> {
        if self.message.is_some() {
            return Err(AlreadyWritten);
        }
        self.message = Some(message);
        Ok(())
    }

    pub fn take_message(&mut self) -> Option<Message> {
        self.message.take()
    }
}

/// Pipeline that relays every query to an upstream DoH resolver.
pub struct ForwardPipeline {
    client: Client,
    endpoint: String,
    ecs_passthrough: bool,
}

impl ForwardPipeline {
    pub fn new(section: &PipelineSection) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("dohedge/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(section.timeout_secs))
            .build()
            .context("Failed to build upstream DoH client")?;
        Ok(Self {
            client,
            endpoint: section.doh_endpoint(),
            ecs_passthrough: section.ecs_passthrough,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn forward(&self, request: &Message) -> Result<Message> {
        let mut message = request.clone();
        if !self.ecs_passthrough && strip_client_subnet(&mut message) {
            debug!("Stripped EDNS client subnet before forwarding");
        }

        let payload = message
            .to_vec()
            .context("failed to serialise DNS message for upstream forward")?;
        let response = self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, DNS_CONTENT_TYPE)
            .header(header::ACCEPT, DNS_CONTENT_TYPE)
            .body(payload)
            .send()
            .await
            .context("upstream DoH request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!("upstream DoH error: {}", response.status()));
        }
        let bytes = response
            .bytes()
            .await
            .context("failed to read upstream DoH body")?;
        let mut answer =
            Message::from_vec(&bytes).context("failed to parse upstream DoH response")?;
        answer.set_id(request.id());
        Ok(answer)
    }
}

impl DnsPipeline for ForwardPipeline {
    fn serve_dns<'a>(
        &'a self,
        request: &'a Message,
        writer: &'a mut ResponseCapture,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let response = match self.forward(request).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(
                        error = %err,
                        endpoint = %self.endpoint,
                        remote = %writer.remote_addr(),
                        "Upstream DoH forward failed; answering SERVFAIL"
                    );
                    error_response(request, ResponseCode::ServFail)
                }
            };
            if let Err(err) = writer.write_message(response) {
                warn!(error = %err, "Pipeline produced a second response");
            }
        })
    }
}

/// Build an empty response echoing the question of `request`.
pub fn error_response(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(code);
    response.add_queries(request.queries().to_vec());
    response
}

fn strip_client_subnet(message: &mut Message) -> bool {
    if let Some(edns) = message.extensions_mut().as_mut() {
        if edns.option(EdnsCode::Subnet).is_some() {
            edns.options_mut().remove(EdnsCode::Subnet);
            return true;
        }
    }
    false
}
