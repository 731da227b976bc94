use anyhow::{anyhow, bail, Result};

/// Percent-encode `key=value` pairs joined by `&`.
pub fn encode_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build a streaming URL from a page origin: the HTTP(S) scheme is swapped for
/// its websocket counterpart, then the path and encoded query are appended.
pub fn stream_url(origin: &str, path: &str, query: &[(String, String)]) -> Result<String> {
    let (scheme, rest) = origin
        .trim()
        .split_once("://")
        .ok_or_else(|| anyhow!("origin without scheme: {}", origin))?;
    let ws = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("unsupported origin scheme: {}", other),
    };
    let host = rest.trim_end_matches('/');
    if host.is_empty() {
        bail!("origin without host: {}", origin);
    }
    let sep = if path.starts_with('/') { "" } else { "/" };
    let mut url = format!("{}://{}{}{}", ws, host, sep, path);
    if !query.is_empty() {
        url.push('?');
        url.push_str(&encode_query(query));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn swaps_scheme_and_encodes_query() {
        let url = stream_url(
            "https://dash.example.com/",
            "/api/watch/pods",
            &q(&[("environment", "prod"), ("labelSelector", "app=web,tier!=db")]),
        )
        .unwrap();
        assert_eq!(
            url,
            "wss://dash.example.com/api/watch/pods?environment=prod&labelSelector=app%3Dweb%2Ctier%21%3Ddb"
        );
        assert_eq!(stream_url("http://localhost:8080", "x", &[]).unwrap(), "ws://localhost:8080/x");
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(stream_url("ftp://host", "/a", &[]).is_err());
        assert!(stream_url("localhost:8080", "/a", &[]).is_err());
        assert!(stream_url("http://", "/a", &[]).is_err());
    }
}
