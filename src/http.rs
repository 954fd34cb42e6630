// http.rs - HTTP client contract and bounded response handling

use crate::*;

/// Hard ceiling on any response body we are willing to hold in memory.
pub const REMOTE_CONFIG_MAX_SIZE: usize = 4096;
pub const SERVER_TIMEOUT_MS: u64 = 12_000;
pub const HTTP_OK: u16 = 200;

pub type BoundedBody = heapless::Vec<u8, REMOTE_CONFIG_MAX_SIZE>;

/// A response whose headers have arrived but whose body is still on the wire.
pub trait HttpResponse {
    fn status(&self) -> u16;
    /// Declared Content-Length, if the server sent one.
    fn content_length(&self) -> Option<u64>;
    fn read(&mut self, buf: &mut [u8]) -> AppResult<usize>;
}

pub trait HttpClient {
    fn post<'a>(
        &'a mut self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> AppResult<Box<dyn HttpResponse + 'a>>;
}

/// Load the body only if status is 200 and a non-zero Content-Length no
/// larger than [`REMOTE_CONFIG_MAX_SIZE`] was declared. A missing size is
/// always a rejection, whatever the status.
pub fn read_bounded_body(resp: &mut dyn HttpResponse, tag: &str) -> Option<BoundedBody> {
    let status = resp.status();
    if status != HTTP_OK {
        info!("{tag}: Response code is not 200: {status}");
        return None;
    }

    let len = match resp.content_length() {
        Some(len) if len > 0 => len,
        _ => {
            error!("{tag}: Server did not provide Content-Length, rejecting response");
            return None;
        }
    };
    info!("{tag}: Content-Length from server: {len}");

    if len > REMOTE_CONFIG_MAX_SIZE as u64 {
        error!("{tag}: Response too large: {len} bytes (max: {REMOTE_CONFIG_MAX_SIZE} bytes)");
        return None;
    }

    let mut body = BoundedBody::new();
    if body.resize_default(len as usize).is_err() {
        return None;
    }
    let mut filled = 0;
    while filled < body.len() {
        match resp.read(&mut body[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => {
                error!("{tag}: Body read failed: {e}");
                return None;
            }
        }
    }
    body.truncate(filled);
    info!("{tag}: Actual response size: {filled} bytes");
    Some(body)
}

#[derive(Debug, Default)]
pub struct PostResult {
    /// Transport-level success: the server answered 200.
    pub ok: bool,
    pub body: Option<BoundedBody>,
}

/// POST a JSON payload with the device credentials in headers.
pub fn post_json(
    http: &mut dyn HttpClient,
    url: &str,
    key: &str,
    email: &str,
    payload: &str,
    tag: &str,
) -> PostResult {
    let mut headers = vec![("Content-Type", "application/json")];
    if !key.is_empty() {
        headers.push(("Waterius-Token", key));
    }
    if !email.is_empty() {
        headers.push(("Waterius-Email", email));
    }

    info!("{tag}: POST {url}");
    let mut resp = match http.post(url, &headers, payload.as_bytes()) {
        Ok(r) => r,
        Err(e) => {
            error!("{tag}: Request failed: {e}");
            return PostResult::default();
        }
    };

    let status = resp.status();
    info!("{tag}: Response code: {status}");
    PostResult {
        ok: status == HTTP_OK,
        body: read_bounded_body(resp.as_mut(), tag),
    }
}


// EOF
