//! Bidirectional namespace translation between the gateway and backends
//!
//! Externally an exhibit lives under `/exhibit/{id}/...`; the backend is
//! origin-rooted and emits links against its own origin. Responses get the
//! prefix injected after the externally-known host, requests get it stripped
//! again. Bodies are always decoded from their content encoding before any
//! substitution and re-encoded afterwards.

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use hyper::header::{HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH};
use hyper::HeaderMap;
use std::io::{Read, Write};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("failed to decode body: {0}")]
    Decode(String),
    #[error("failed to encode body: {0}")]
    Encode(String),
}

/// Rewrites request/response content between the external and internal
/// namespaces
pub struct RewriteService {
    /// Externally-known gateway address, e.g. `gw.example.org:8080`
    public_host: String,
}

impl RewriteService {
    pub fn new(public_host: impl Into<String>) -> Self {
        Self {
            public_host: public_host.into(),
        }
    }

    fn prefix(exhibit_id: &str) -> String {
        format!("/exhibit/{}", exhibit_id)
    }

    /// Strip the external prefix from a client request so the backend sees
    /// origin-rooted paths. Returns the rewritten path-and-query and body.
    pub fn rewrite_client_request(
        &self,
        exhibit_id: &str,
        headers: &mut HeaderMap,
        path_and_query: &str,
        body: Vec<u8>,
    ) -> Result<(String, Vec<u8>), RewriteError> {
        let prefix = Self::prefix(exhibit_id);
        let encoding = content_encoding(headers);

        let decoded = decode_body(body, encoding.as_deref())?;
        // form posts and query-ish bodies may carry the prefix URL-encoded
        let unescaped = urlencoding::decode_binary(&decoded).into_owned();
        let stripped = replace_all(&unescaped, prefix.as_bytes(), b"");

        for value in headers.values_mut() {
            if let Ok(text) = value.to_str() {
                if text.contains(&prefix) {
                    let rewritten = text.replace(&prefix, "");
                    if let Ok(new_value) = HeaderValue::from_str(&rewritten) {
                        *value = new_value;
                    }
                }
            }
        }

        let encoded = encode_body(stripped, encoding.as_deref())?;
        set_content_length(headers, encoded.len());

        let rewritten_path = path_and_query.replace(&prefix, "");
        let rewritten_path = if rewritten_path.is_empty() {
            "/".to_string()
        } else {
            rewritten_path
        };
        Ok((rewritten_path, encoded))
    }

    /// Inject the external prefix after every occurrence of the public host
    /// in a server response so embedded links keep resolving through the
    /// gateway.
    pub fn rewrite_server_response(
        &self,
        exhibit_id: &str,
        headers: &mut HeaderMap,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, RewriteError> {
        let encoding = content_encoding(headers);
        let decoded = decode_body(body, encoding.as_deref())?;

        let search = self.public_host.clone();
        let replacement = format!("{}{}", self.public_host, Self::prefix(exhibit_id));
        let rewritten = substitute(&decoded, search.as_bytes(), replacement.as_bytes());

        let encoded = encode_body(rewritten, encoding.as_deref())?;
        set_content_length(headers, encoded.len());
        Ok(encoded)
    }
}

/// Collision-safe substitution: the replacement text may already appear in
/// the body, so a straight replace would double it up on the way back. Swap
/// existing occurrences of the replacement to a placeholder first, run the
/// substitution, then restore the placeholder. The placeholder token is
/// freshly generated per call so concurrent rewrites can never collide on
/// one shared constant.
fn substitute(body: &[u8], search: &[u8], replacement: &[u8]) -> Vec<u8> {
    let placeholder = Uuid::new_v4().simple().to_string();
    let step1 = replace_all(body, replacement, placeholder.as_bytes());
    let step2 = replace_all(&step1, search, replacement);
    replace_all(&step2, placeholder.as_bytes(), replacement)
}

/// Byte-wise replace-all; bodies are not guaranteed to be valid UTF-8
fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return haystack.to_vec();
    }

    let mut result = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if i + needle.len() <= haystack.len() && &haystack[i..i + needle.len()] == needle {
            result.extend_from_slice(replacement);
            i += needle.len();
        } else {
            result.push(haystack[i]);
            i += 1;
        }
    }
    result
}

fn content_encoding(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_lowercase())
}

fn decode_body(body: Vec<u8>, encoding: Option<&str>) -> Result<Vec<u8>, RewriteError> {
    match encoding {
        None | Some("") | Some("identity") => Ok(body),
        Some("gzip") | Some("x-gzip") => {
            let mut decoded = Vec::new();
            GzDecoder::new(body.as_slice())
                .read_to_end(&mut decoded)
                .map_err(|e| RewriteError::Decode(e.to_string()))?;
            Ok(decoded)
        }
        Some("deflate") => {
            let mut decoded = Vec::new();
            ZlibDecoder::new(body.as_slice())
                .read_to_end(&mut decoded)
                .map_err(|e| RewriteError::Decode(e.to_string()))?;
            Ok(decoded)
        }
        Some(other) => Err(RewriteError::UnsupportedEncoding(other.to_string())),
    }
}

fn encode_body(body: Vec<u8>, encoding: Option<&str>) -> Result<Vec<u8>, RewriteError> {
    match encoding {
        None | Some("") | Some("identity") => Ok(body),
        Some("gzip") | Some("x-gzip") => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&body)
                .and_then(|_| encoder.finish())
                .map_err(|e| RewriteError::Encode(e.to_string()))
        }
        Some("deflate") => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&body)
                .and_then(|_| encoder.finish())
                .map_err(|e| RewriteError::Encode(e.to_string()))
        }
        Some(other) => Err(RewriteError::UnsupportedEncoding(other.to_string())),
    }
}

fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "gw:8080";

    fn service() -> RewriteService {
        RewriteService::new(HOST)
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut decoded = Vec::new();
        GzDecoder::new(data).read_to_end(&mut decoded).unwrap();
        decoded
    }

    #[test]
    fn test_response_injects_prefix() {
        let mut headers = HeaderMap::new();
        let body = b"<a href=\"http://gw:8080/page\">link</a>".to_vec();

        let rewritten = service()
            .rewrite_server_response("E", &mut headers, body)
            .unwrap();
        assert_eq!(
            rewritten,
            b"<a href=\"http://gw:8080/exhibit/E/page\">link</a>".to_vec()
        );
        assert_eq!(
            headers.get(CONTENT_LENGTH).unwrap().to_str().unwrap(),
            rewritten.len().to_string()
        );
    }

    #[test]
    fn test_response_with_zero_occurrences_unchanged() {
        let mut headers = HeaderMap::new();
        let body = b"no links here".to_vec();
        let rewritten = service()
            .rewrite_server_response("E", &mut headers, body.clone())
            .unwrap();
        assert_eq!(rewritten, body);
    }

    #[test]
    fn test_response_leaves_already_prefixed_links_alone() {
        // adversarial case: the body already contains the replacement token
        let mut headers = HeaderMap::new();
        let body = b"http://gw:8080/exhibit/E/a and http://gw:8080/b".to_vec();

        let rewritten = service()
            .rewrite_server_response("E", &mut headers, body)
            .unwrap();
        assert_eq!(
            rewritten,
            b"http://gw:8080/exhibit/E/a and http://gw:8080/exhibit/E/b".to_vec()
        );
    }

    #[test]
    fn test_round_trip_is_loss_free() {
        let service = service();
        let original = b"go to http://gw:8080/home or http://gw:8080/exhibit/E/deep".to_vec();

        let mut headers = HeaderMap::new();
        let response = service
            .rewrite_server_response("E", &mut headers, original)
            .unwrap();

        // a client echoing the rewritten content back through the gateway
        let mut req_headers = HeaderMap::new();
        let (_, request) = service
            .rewrite_client_request("E", &mut req_headers, "/exhibit/E/echo", response)
            .unwrap();
        assert_eq!(
            request,
            b"go to http://gw:8080/home or http://gw:8080/deep".to_vec()
        );
    }

    #[test]
    fn test_gzip_body_rewritten_and_recompressed() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let body = gzip(b"see http://gw:8080/res");

        let rewritten = service()
            .rewrite_server_response("E", &mut headers, body)
            .unwrap();
        assert_eq!(gunzip(&rewritten), b"see http://gw:8080/exhibit/E/res");
        // still gzip on the wire
        assert_eq!(&rewritten[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_unsupported_encoding_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        let result = service().rewrite_server_response("E", &mut headers, b"x".to_vec());
        assert!(matches!(result, Err(RewriteError::UnsupportedEncoding(_))));
    }

    #[test]
    fn test_corrupt_gzip_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let result =
            service().rewrite_server_response("E", &mut headers, b"not gzip at all".to_vec());
        assert!(matches!(result, Err(RewriteError::Decode(_))));
    }

    #[test]
    fn test_request_strips_prefix_from_path_and_body() {
        let mut headers = HeaderMap::new();
        headers.insert("referer", HeaderValue::from_static("/exhibit/E/page"));
        let body = b"back to /exhibit/E/home".to_vec();

        let (path, rewritten) = service()
            .rewrite_client_request("E", &mut headers, "/exhibit/E/form?next=/exhibit/E/done", body)
            .unwrap();

        assert_eq!(path, "/form?next=/done");
        assert_eq!(rewritten, b"back to /home".to_vec());
        assert_eq!(headers.get("referer").unwrap(), "/page");
    }

    #[test]
    fn test_request_url_decodes_before_stripping() {
        let mut headers = HeaderMap::new();
        let body = b"next=%2Fexhibit%2FE%2Fdone".to_vec();

        let (_, rewritten) = service()
            .rewrite_client_request("E", &mut headers, "/exhibit/E/submit", body)
            .unwrap();
        assert_eq!(rewritten, b"next=/done".to_vec());
    }

    #[test]
    fn test_request_prefix_only_path_becomes_root() {
        let mut headers = HeaderMap::new();
        let (path, _) = service()
            .rewrite_client_request("E", &mut headers, "/exhibit/E", Vec::new())
            .unwrap();
        assert_eq!(path, "/");
    }

    #[test]
    fn test_substitute_when_search_contains_replacement_seed() {
        // many occurrences, search and replacement overlapping
        let body = b"a gw:8080 b gw:8080/exhibit/X c gw:8080".to_vec();
        let result = substitute(&body, b"gw:8080", b"gw:8080/exhibit/X");
        assert_eq!(
            result,
            b"a gw:8080/exhibit/X b gw:8080/exhibit/X c gw:8080/exhibit/X".to_vec()
        );
    }

    #[test]
    fn test_replace_all_binary_safe() {
        let body = vec![0u8, 1, 2, b'x', b'y', 3, 0, b'x', b'y'];
        let result = replace_all(&body, b"xy", b"Z");
        assert_eq!(result, vec![0u8, 1, 2, b'Z', 3, 0, b'Z']);
    }
}
