use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

/// Body of an upstream reply: buffered for non-streaming calls and error
/// statuses, a byte channel for live streams. The reader task stops as soon
/// as the receiver is dropped, which is how client disconnects propagate.
#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Result<Bytes, String>>),
}

pub struct UpstreamResponse {
    pub status: u16,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone)]
pub struct UpstreamFailure {
    pub message: String,
    pub timeout: bool,
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    /// Empty string means unauthenticated (self-hosted upstreams).
    pub bearer: String,
    pub body: Option<Bytes>,
    pub is_stream: bool,
    /// Whole-call budget for buffered requests; time-to-headers for streams.
    pub timeout: Duration,
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamFailure>> + Send + 'a>>;
}

#[derive(Clone)]
pub struct HttpUpstreamClient {
    client: reqwest::Client,
}

impl HttpUpstreamClient {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl UpstreamClient for HttpUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut builder = if req.body.is_some() {
                self.client.post(&req.url)
            } else {
                self.client.get(&req.url)
            };
            if !req.bearer.is_empty() {
                builder = builder.bearer_auth(&req.bearer);
            }
            if let Some(body) = req.body {
                builder = builder
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body);
            }

            // A stream's budget only covers time-to-headers; the body is
            // read for as long as the model keeps generating.
            let response = if req.is_stream {
                match tokio::time::timeout(req.timeout, builder.send()).await {
                    Ok(result) => result.map_err(map_error)?,
                    Err(_) => {
                        return Err(UpstreamFailure {
                            message: format!("upstream connect timeout ({:?})", req.timeout),
                            timeout: true,
                        })
                    }
                }
            } else {
                builder
                    .timeout(req.timeout)
                    .send()
                    .await
                    .map_err(map_error)?
            };

            let status = response.status().as_u16();
            let success = (200..300).contains(&status);
            if !success || !req.is_stream {
                let body = response.bytes().await.map_err(map_error)?;
                return Ok(UpstreamResponse {
                    status,
                    body: UpstreamBody::Bytes(body),
                });
            }

            let (tx, rx) = mpsc::channel::<Result<Bytes, String>>(16);
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                while let Some(item) = stream.next().await {
                    let out = item.map_err(|err| err.to_string());
                    let failed = out.is_err();
                    if tx.send(out).await.is_err() {
                        // Receiver gone: the downstream client disconnected.
                        break;
                    }
                    if failed {
                        break;
                    }
                }
            });

            Ok(UpstreamResponse {
                status,
                body: UpstreamBody::Stream(rx),
            })
        })
    }
}

fn map_error(err: reqwest::Error) -> UpstreamFailure {
    UpstreamFailure {
        message: err.to_string(),
        timeout: err.is_timeout(),
    }
}
