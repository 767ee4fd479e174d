// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Header transforms between the client-facing HTTP/3 session and
//! backends: path canonicalization, hop-by-hop stripping, `server`/`via`
//! rewriting, WebSocket tunnel translation, and redirect construction.

use quiche::h3;

use crate::proxy::AffinityCookie;
use crate::settings::HttpSettings;

/// Methods this endpoint is willing to forward. Anything else earns a 501.
const KNOWN_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE",
    "PATCH",
];

pub(crate) fn is_known_method(method: &str) -> bool {
    KNOWN_METHODS.contains(&method)
}

/// Connection-scoped headers that must not travel through a proxy hop.
fn is_hop_by_hop(name: &[u8]) -> bool {
    matches!(
        name,
        b"connection" |
            b"keep-alive" |
            b"proxy-connection" |
            b"transfer-encoding" |
            b"upgrade" |
            b"te" |
            b"host"
    )
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Canonicalizes a request path: percent-decodes unreserved characters,
/// upper-cases the remaining escapes, and removes dot segments. The query
/// string is preserved untouched. Idempotent, and only applied to
/// origin-form paths; anything else passes through verbatim.
pub(crate) fn clean_path(path: &str) -> String {
    let (raw_path, query) = match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    };

    if !raw_path.starts_with('/') {
        return path.to_string();
    }

    let bytes = raw_path.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) =
                (hex_val(bytes[i + 1]), hex_val(bytes[i + 2]))
            {
                let b = (hi << 4) | lo;
                if is_unreserved(b) {
                    decoded.push(b);
                } else {
                    decoded.push(b'%');
                    decoded.push(bytes[i + 1].to_ascii_uppercase());
                    decoded.push(bytes[i + 2].to_ascii_uppercase());
                }
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    let mut out = remove_dot_segments(&decoded);

    if let Some(query) = query {
        out.push('?');
        out.push_str(query);
    }

    out
}

fn remove_dot_segments(path: &[u8]) -> String {
    let mut segments: Vec<&[u8]> = Vec::new();
    let trailing_slash = matches!(path.last(), Some(b'/'));

    for segment in path.split(|b| *b == b'/') {
        match segment {
            b"" | b"." => {},
            b".." => {
                segments.pop();
            },
            other => segments.push(other),
        }
    }

    let mut out = String::from("/");
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(&String::from_utf8_lossy(segment));
    }

    // "/a/b/" keeps its trailing slash; ".." and "." endings resolve to a
    // directory as well.
    if trailing_slash ||
        path.ends_with(b"/..") ||
        path.ends_with(b"/.")
    {
        if !out.ends_with('/') {
            out.push('/');
        }
    }

    out
}

/// Builds the client-facing response header section from what the backend
/// produced.
///
/// `tunnel` marks a CONNECT whose response carries no HTTP payload;
/// `websocket` marks an extended CONNECT whose 101 must read as 200 with
/// the `sec-websocket-accept` handshake artifact removed.
pub(crate) fn build_response_headers(
    status: u16, backend_headers: &[(Vec<u8>, Vec<u8>)],
    http: &HttpSettings, websocket: bool, tunnel: bool,
    cookie: Option<&AffinityCookie>, backend_authority: Option<&str>,
    frontend_authority: Option<&str>,
) -> Vec<h3::Header> {
    let effective_status = if websocket && status == 101 { 200 } else { status };

    let mut out = Vec::with_capacity(backend_headers.len() + 4);
    out.push(h3::Header::new(
        b":status",
        effective_status.to_string().as_bytes(),
    ));

    let mut via_value: Option<Vec<u8>> = None;

    for (name, value) in backend_headers {
        let name = name.to_ascii_lowercase();

        if is_hop_by_hop(&name) {
            continue;
        }

        match name.as_slice() {
            b"sec-websocket-accept" if websocket => continue,
            b"server" if !http.no_server_rewrite => continue,
            b"via" => {
                via_value = Some(value.clone());
                continue;
            },
            b"location" => {
                let rewritten = rewrite_location(
                    value,
                    http,
                    backend_authority,
                    frontend_authority,
                );
                out.push(h3::Header::new(b"location", &rewritten));
                continue;
            },
            _ => {},
        }

        out.push(h3::Header::new(&name, value));
    }

    if !http.no_server_rewrite {
        out.push(h3::Header::new(b"server", http.server_name.as_bytes()));
    }

    if !http.no_via {
        let hop = format!("1.1 {}", http.server_name);
        let via = match via_value {
            Some(mut existing) => {
                existing.extend_from_slice(b", ");
                existing.extend_from_slice(hop.as_bytes());
                existing
            },
            None => hop.into_bytes(),
        };
        out.push(h3::Header::new(b"via", &via));
    } else if let Some(existing) = via_value {
        out.push(h3::Header::new(b"via", &existing));
    }

    if let Some(cookie) = cookie.filter(|_| !tunnel) {
        out.push(h3::Header::new(
            b"set-cookie",
            cookie.header_value().as_bytes(),
        ));
    }

    for field in &http.add_response_headers {
        if let Some((name, value)) = field.split_once(':') {
            out.push(h3::Header::new(
                name.trim().to_ascii_lowercase().as_bytes(),
                value.trim().as_bytes(),
            ));
        }
    }

    out
}

/// Rewrites a backend `location` header so redirects pointing back at the
/// backend land on the frontend authority instead.
fn rewrite_location(
    value: &[u8], http: &HttpSettings, backend_authority: Option<&str>,
    frontend_authority: Option<&str>,
) -> Vec<u8> {
    if http.no_location_rewrite {
        return value.to_vec();
    }

    let (Some(backend), Some(frontend)) =
        (backend_authority, frontend_authority)
    else {
        return value.to_vec();
    };

    let Ok(s) = std::str::from_utf8(value) else {
        return value.to_vec();
    };

    for scheme in ["http://", "https://"] {
        if let Some(rest) = s.strip_prefix(scheme) {
            if let Some(path) = rest.strip_prefix(backend) {
                return format!("{scheme}{frontend}{path}").into_bytes();
            }
        }
    }

    value.to_vec()
}

/// The `https://` redirect target for a backend that demands TLS. `None`
/// when no well-formed target can be built (the caller replies 400).
pub(crate) fn https_redirect_location(
    scheme: Option<&str>, authority: Option<&str>, path: Option<&str>,
    redirect_port: u16,
) -> Option<String> {
    if scheme != Some("http") {
        return None;
    }

    let authority = authority?;
    let host = authority
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(authority);
    if host.is_empty() {
        return None;
    }

    let path = path.unwrap_or("/");

    Some(if redirect_port == 443 {
        format!("https://{host}{path}")
    } else {
        format!("https://{host}:{redirect_port}{path}")
    })
}

/// Reason phrase for the statuses this endpoint generates itself.
pub(crate) fn status_text(status: u16) -> &'static str {
    match status {
        308 => "Permanent Redirect",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        425 => "Too Early",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

/// The canned HTML body of a locally generated error reply.
pub(crate) fn error_reply_body(status: u16, server_name: &str) -> String {
    let text = status_text(status);
    format!(
        "<html><head><title>{status} {text}</title></head>\
         <body><h1>{status} {text}</h1><hr>\
         <address>{server_name}</address></body></html>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use quiche::h3::NameValue;

    fn http_settings() -> HttpSettings {
        serde_json::from_str("{}").unwrap()
    }

    fn find<'a>(
        headers: &'a [h3::Header], name: &[u8],
    ) -> Option<&'a h3::Header> {
        headers.iter().find(|h| h.name() == name)
    }

    #[test]
    fn clean_path_is_idempotent() {
        for path in [
            "/a/b/../c",
            "/a/./b//c",
            "/%41%2f%7e",
            "/a%3Fb",
            "/..",
            "/a/b/",
            "/search?q=%2F..%2F",
            "*",
        ] {
            let once = clean_path(path);
            assert_eq!(clean_path(&once), once, "not idempotent for {path}");
        }
    }

    #[test]
    fn clean_path_resolves_dot_segments() {
        assert_eq!(clean_path("/a/b/../c"), "/a/c");
        assert_eq!(clean_path("/a/./b"), "/a/b");
        assert_eq!(clean_path("/../../x"), "/x");
        assert_eq!(clean_path("/a/.."), "/");
    }

    #[test]
    fn clean_path_normalizes_percent_encoding() {
        // Unreserved characters decode, everything else upper-cases.
        assert_eq!(clean_path("/%41%62%7e"), "/Ab~");
        assert_eq!(clean_path("/a%3fb"), "/a%3Fb");
        // The query string is untouched.
        assert_eq!(clean_path("/a/../b?x=%2f%2e%2e"), "/b?x=%2f%2e%2e");
    }

    #[test]
    fn clean_path_passes_asterisk_form_through() {
        assert_eq!(clean_path("*"), "*");
    }

    #[test]
    fn response_headers_get_200() {
        let http = http_settings();
        let backend = vec![
            (b"content-type".to_vec(), b"text/plain".to_vec()),
            (b"connection".to_vec(), b"keep-alive".to_vec()),
        ];

        let out = build_response_headers(
            200, &backend, &http, false, false, None, None, None,
        );

        assert_eq!(find(&out, b":status").unwrap().value(), b"200");
        assert!(find(&out, b"content-type").is_some());
        // Hop-by-hop headers never pass through.
        assert!(find(&out, b"connection").is_none());
        assert_eq!(find(&out, b"server").unwrap().value(), b"h3gate");
        assert_eq!(find(&out, b"via").unwrap().value(), b"1.1 h3gate");
    }

    #[test]
    fn websocket_101_reads_as_200() {
        let http = http_settings();
        let backend = vec![
            (b"sec-websocket-accept".to_vec(), b"xyz".to_vec()),
            (b"upgrade".to_vec(), b"websocket".to_vec()),
        ];

        let out = build_response_headers(
            101, &backend, &http, true, true, None, None, None,
        );

        assert_eq!(find(&out, b":status").unwrap().value(), b"200");
        assert!(find(&out, b"sec-websocket-accept").is_none());
        assert!(find(&out, b"upgrade").is_none());
    }

    #[test]
    fn via_chains_behind_existing_hops() {
        let http = http_settings();
        let backend = vec![(b"via".to_vec(), b"1.1 origin".to_vec())];

        let out = build_response_headers(
            200, &backend, &http, false, false, None, None, None,
        );

        assert_eq!(
            find(&out, b"via").unwrap().value(),
            b"1.1 origin, 1.1 h3gate"
        );
    }

    #[test]
    fn affinity_cookie_skips_tunnels() {
        let http = http_settings();
        let cookie = AffinityCookie {
            name: "lb".to_string(),
            value: "aa".to_string(),
            path: None,
            secure: true,
        };

        let with = build_response_headers(
            200, &[], &http, false, false, Some(&cookie), None, None,
        );
        assert!(find(&with, b"set-cookie").is_some());

        let tunneled = build_response_headers(
            200, &[], &http, false, true, Some(&cookie), None, None,
        );
        assert!(find(&tunneled, b"set-cookie").is_none());
    }

    #[test]
    fn location_rewrites_backend_authority() {
        let http = http_settings();
        let backend =
            vec![(b"location".to_vec(), b"http://10.0.0.8:8080/x".to_vec())];

        let out = build_response_headers(
            301,
            &backend,
            &http,
            false,
            false,
            None,
            Some("10.0.0.8:8080"),
            Some("a.example"),
        );

        assert_eq!(
            find(&out, b"location").unwrap().value(),
            b"http://a.example/x"
        );

        // Redirects to unrelated hosts pass through untouched.
        let backend =
            vec![(b"location".to_vec(), b"https://other.example/".to_vec())];
        let out = build_response_headers(
            301,
            &backend,
            &http,
            false,
            false,
            None,
            Some("10.0.0.8:8080"),
            Some("a.example"),
        );
        assert_eq!(
            find(&out, b"location").unwrap().value(),
            b"https://other.example/"
        );
    }

    #[test]
    fn https_redirect_construction() {
        assert_eq!(
            https_redirect_location(
                Some("http"),
                Some("a.example"),
                Some("/x?q=1"),
                443
            )
            .unwrap(),
            "https://a.example/x?q=1"
        );

        assert_eq!(
            https_redirect_location(
                Some("http"),
                Some("a.example:8080"),
                Some("/"),
                8443
            )
            .unwrap(),
            "https://a.example:8443/"
        );

        // Only plain-http requests are eligible.
        assert!(https_redirect_location(
            Some("https"),
            Some("a.example"),
            Some("/"),
            443
        )
        .is_none());
        assert!(
            https_redirect_location(Some("http"), None, Some("/"), 443)
                .is_none()
        );
    }
}
