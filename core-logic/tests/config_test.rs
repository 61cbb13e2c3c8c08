use core_logic::config::{EndpointConfig, ProxyConfig};
use core_logic::{load_proxies, parse_proxy_line, ConfigError};
use std::io::Write;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_line_with_auth() {
        let proxy = parse_proxy_line("10.0.0.1:8080:user:pass", 1)
            .unwrap()
            .unwrap();

        assert_eq!(proxy.url, "http://10.0.0.1:8080");
        assert_eq!(proxy.username, Some("user".to_string()));
        assert_eq!(proxy.password, Some("pass".to_string()));
    }

    #[test]
    fn test_proxy_line_no_auth() {
        let proxy = parse_proxy_line("  10.0.0.2:3128  ", 1).unwrap().unwrap();

        assert!(proxy.username.is_none());
        assert!(proxy.password.is_none());
        assert_eq!(proxy.url, "http://10.0.0.2:3128");
    }

    #[test]
    fn test_proxy_line_comments_and_blanks() {
        assert!(parse_proxy_line("", 1).unwrap().is_none());
        assert!(parse_proxy_line("# backup pool", 2).unwrap().is_none());
    }

    #[test]
    fn test_proxy_line_rejects_garbage() {
        let err = parse_proxy_line("10.0.0.1:notaport", 7).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidProxyLine {
                line: 7,
                content: "10.0.0.1:notaport".to_string()
            }
        );
        assert!(parse_proxy_line("10.0.0.1:80:user", 1).is_err());
    }

    #[test]
    fn test_load_proxies_skips_bad_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# pool").unwrap();
        writeln!(file, "1.1.1.1:8000:a:b").unwrap();
        writeln!(file, "broken").unwrap();
        writeln!(file, "2.2.2.2:8001").unwrap();

        let proxies = load_proxies(file.path()).unwrap();
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[1].url, "http://2.2.2.2:8001");
    }

    #[test]
    fn test_load_proxies_missing_file_is_empty() {
        let proxies = load_proxies("/definitely/not/here/proxies.txt").unwrap();
        assert!(proxies.is_empty());
    }

    #[test]
    fn test_endpoint_config_deserialize() {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            endpoints: Vec<EndpointConfig>,
        }

        let raw = r#"{
            "endpoints": [
                {"id": "direct", "rpc_url": "https://rpc.example.com"},
                {
                    "id": "proxied",
                    "proxy": {"url": "http://1.2.3.4:80", "username": null, "password": null}
                }
            ]
        }"#;
        let parsed: Wrapper = serde_json::from_str(raw).unwrap();

        assert_eq!(parsed.endpoints.len(), 2);
        assert_eq!(parsed.endpoints[0].proxy, None);
        assert_eq!(
            parsed.endpoints[1].proxy,
            Some(ProxyConfig {
                url: "http://1.2.3.4:80".to_string(),
                username: None,
                password: None,
            })
        );
    }
}
