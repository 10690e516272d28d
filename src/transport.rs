use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::{Method, Url};
use tracing::debug;
use uuid::Uuid;

use crate::error::TestError;
use crate::payload::Payload;

pub type StopFlag = Arc<AtomicBool>;

pub const USER_AGENT: &str = concat!("qospeedtest/", env!("CARGO_PKG_VERSION"));

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 64 * 1024;

/// Result of one download request.
#[derive(Clone, Copy, Debug)]
pub struct Downloaded {
    pub received: u64,
    /// Body transfer time, measured from the arrival of the response headers.
    pub elapsed: Duration,
}

/// Result of one upload request.
#[derive(Clone, Debug)]
pub struct Uploaded {
    /// Raw confirmation body, expected to read `size=N`.
    pub confirmation: String,
    /// Full round trip, from sending the request to reading the confirmation.
    pub elapsed: Duration,
}

/// Request/response exchange with a speed test server.
///
/// Implementations only move bytes and time them; checking the replies
/// against the protocol is the sampler's job.
pub trait Transport {
    fn hello(&mut self) -> Result<String, TestError>;

    fn download(&mut self, size: u64, stop: &StopFlag) -> Result<Downloaded, TestError>;

    fn upload(&mut self, payload: Payload, stop: &StopFlag) -> Result<Uploaded, TestError>;
}

/// Random UUID-v4 token, as used for the `guid` and `nocache` parameters.
pub fn guid() -> String {
    Uuid::new_v4().to_string()
}

/// [`Transport`] over a blocking reqwest client.
pub struct HttpTransport {
    client: Client,
    base: Url,
    session: String,
}

impl HttpTransport {
    /// `base` must end in `/` so endpoint names join under it.
    pub fn new(base: Url, timeout: Duration) -> Result<Self, TestError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| TestError::transport(base.as_str(), e))?;
        let session = guid();
        debug!(base = %base, session = %session, "HTTP transport ready");
        Ok(Self { client, base, session })
    }

    fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<(Url, RequestBuilder), TestError> {
        let url = self.base.join(endpoint).map_err(|e| TestError::transport(self.base.as_str(), e))?;
        let builder = self
            .client
            .request(method, url.clone())
            .query(params)
            .query(&[("guid", self.session.as_str()), ("nocache", guid().as_str())]);
        Ok((url, builder))
    }
}

fn check_status(url: &Url, response: Response) -> Result<Response, TestError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TestError::Status {
            url: url.to_string(),
            status,
        })
    }
}

fn send_error(url: &Url, err: reqwest::Error, stop: &StopFlag) -> TestError {
    if stop.load(Ordering::Relaxed) {
        TestError::Interrupted
    } else {
        TestError::transport(url.as_str(), err)
    }
}

impl Transport for HttpTransport {
    fn hello(&mut self) -> Result<String, TestError> {
        let (url, request) = self.request(Method::GET, "hello", &[])?;
        let response = request.send().map_err(|e| TestError::transport(url.as_str(), e))?;
        let response = check_status(&url, response)?;
        response.text().map_err(|e| TestError::transport(url.as_str(), e))
    }

    fn download(&mut self, size: u64, stop: &StopFlag) -> Result<Downloaded, TestError> {
        let (url, request) = self.request(Method::GET, "download", &[("size", size.to_string())])?;
        let response = request.send().map_err(|e| send_error(&url, e, stop))?;
        let mut response = check_status(&url, response)?;

        let start = Instant::now();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut received: u64 = 0;
        loop {
            if stop.load(Ordering::Relaxed) {
                return Err(TestError::Interrupted);
            }
            match response.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received += n as u64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TestError::transport(url.as_str(), e)),
            }
        }
        Ok(Downloaded {
            received,
            elapsed: start.elapsed(),
        })
    }

    fn upload(&mut self, payload: Payload, stop: &StopFlag) -> Result<Uploaded, TestError> {
        let (url, request) = self.request(Method::POST, "upload", &[])?;
        let len = payload.remaining();
        let body = Body::sized(
            StopReader {
                inner: payload.into_reader(),
                stop: Arc::clone(stop),
            },
            len,
        );

        let start = Instant::now();
        let response = request.body(body).send().map_err(|e| send_error(&url, e, stop))?;
        let response = check_status(&url, response)?;
        let confirmation = response.text().map_err(|e| send_error(&url, e, stop))?;
        Ok(Uploaded {
            confirmation,
            elapsed: start.elapsed(),
        })
    }
}

/// Fails the body stream once the stop flag is raised.
struct StopReader<R> {
    inner: R,
    stop: StopFlag,
}

impl<R: Read> Read for StopReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(io::Error::other("upload interrupted"));
        }
        self.inner.read(buf)
    }
}
