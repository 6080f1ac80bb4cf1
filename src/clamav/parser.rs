use regex::Regex;

use super::types::{DatabaseHeader, EngineVerdict, Version};
use crate::error::{Error, Result};

pub struct Parser;

impl Parser {
    pub fn parse_version(response: &str) -> Result<Version> {
        // Example: ClamAV 0.103.8/26827/Mon Mar 13 08:20:48 2023
        let parts: Vec<&str> = response.trim().split('/').collect();
        if parts.len() < 3 {
            return Err(Error::Parse(format!(
                "Invalid version response: {}",
                response
            )));
        }

        let clamav = parts[0].replace("ClamAV ", "");
        let database = parts[1]
            .parse::<u32>()
            .map_err(|_| Error::Parse(format!("Invalid database version: {}", parts[1])))?;
        let database_date = parts[2].to_string();

        Ok(Version {
            clamav,
            database,
            database_date,
        })
    }

    /// Decodes a `SCAN` or `INSTREAM` reply.
    ///
    /// Replies look like `<subject>: OK`, `<subject>: <signature> FOUND` or
    /// `<subject>: <message> ERROR`, where subject is a path or `stream`.
    pub fn parse_scan_reply(response: &str) -> EngineVerdict {
        let response = response.trim_matches(|c: char| c.is_whitespace() || c == '\0');

        if let Some(found) = response.strip_suffix("FOUND") {
            let found = found.trim_end();
            let name = match found.rsplit_once(": ") {
                Some((_, name)) => name.trim(),
                None => found.trim(),
            };
            let name = if name.is_empty() {
                "Unknown threat".to_string()
            } else {
                name.to_string()
            };
            return EngineVerdict::SignatureFound { name };
        }

        if response.ends_with(": OK") || response == "OK" {
            return EngineVerdict::Clean;
        }

        if let Some(message) = response.strip_suffix("ERROR") {
            let message = message.trim_end();
            let reason = match message.split_once(": ") {
                Some((_, rest)) => rest.trim().to_string(),
                None => message.to_string(),
            };
            return EngineVerdict::EngineError { reason };
        }

        if let Some(message) = response.strip_prefix("ERROR:") {
            return EngineVerdict::EngineError {
                reason: message.trim().to_string(),
            };
        }

        EngineVerdict::EngineError {
            reason: format!("Unexpected response: {}", response),
        }
    }

    /// Parses `ClamAV-VDB:<build time>:<version>:<sigs>:<flevel>:<md5>:...`.
    pub fn parse_database_header(header: &str) -> Result<DatabaseHeader> {
        let header_re = Regex::new(r"^ClamAV-VDB:([^:]*):(\d+):(\d+):(\d+):([0-9a-fA-F]*)")
            .map_err(|e| Error::Parse(format!("Invalid header pattern: {}", e)))?;

        let header = header.trim_end_matches(|c: char| c == ' ' || c == '\0');
        let caps = header_re.captures(header).ok_or_else(|| {
            Error::Parse(format!(
                "Not a signature database header: {}",
                header.chars().take(64).collect::<String>()
            ))
        })?;

        let number = |idx: usize, field: &str| {
            caps[idx]
                .parse::<u32>()
                .map_err(|_| Error::Parse(format!("Invalid {} in header: {}", field, &caps[idx])))
        };

        Ok(DatabaseHeader {
            build_time: caps[1].to_string(),
            version: number(2, "version")?,
            signatures: number(3, "signature count")?,
            functionality_level: number(4, "functionality level")?,
            md5: caps[5].to_lowercase(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        let response = "ClamAV 0.103.8/26827/Mon Mar 13 08:20:48 2023";
        let version = Parser::parse_version(response).unwrap();
        assert_eq!(version.clamav, "0.103.8");
        assert_eq!(version.database, 26827);
        assert_eq!(version.database_date, "Mon Mar 13 08:20:48 2023");
    }

    #[test]
    fn test_parse_version_invalid_format() {
        let result = Parser::parse_version("ClamAV 0.103.8");
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_parse_version_invalid_database_number() {
        let result = Parser::parse_version("ClamAV 0.103.8/abc/Mon Mar 13 08:20:48 2023");
        match result.unwrap_err() {
            Error::Parse(msg) => assert!(msg.contains("Invalid database version")),
            _ => panic!("Expected parse error"),
        }
    }

    #[test]
    fn test_parse_scan_clean() {
        assert_eq!(
            Parser::parse_scan_reply("/srv/q/scanning/a.pdf: OK"),
            EngineVerdict::Clean
        );
        assert_eq!(Parser::parse_scan_reply("stream: OK\0"), EngineVerdict::Clean);
    }

    #[test]
    fn test_parse_scan_infected() {
        assert_eq!(
            Parser::parse_scan_reply("/path/to/file: Win.Trojan.Generic FOUND"),
            EngineVerdict::SignatureFound {
                name: "Win.Trojan.Generic".to_string()
            }
        );
        assert_eq!(
            Parser::parse_scan_reply("stream: Eicar-Test-Signature FOUND"),
            EngineVerdict::SignatureFound {
                name: "Eicar-Test-Signature".to_string()
            }
        );
    }

    #[test]
    fn test_parse_scan_infected_path_with_colon() {
        assert_eq!(
            Parser::parse_scan_reply("/tmp/a:b/file.doc: Doc.Dropper.Agent-1 FOUND"),
            EngineVerdict::SignatureFound {
                name: "Doc.Dropper.Agent-1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_scan_infected_no_colon() {
        assert_eq!(
            Parser::parse_scan_reply("Win.Trojan.Generic FOUND"),
            EngineVerdict::SignatureFound {
                name: "Win.Trojan.Generic".to_string()
            }
        );
    }

    #[test]
    fn test_parse_scan_error() {
        assert_eq!(
            Parser::parse_scan_reply(
                "/q/scanning/x: lstat() failed: No such file or directory. ERROR"
            ),
            EngineVerdict::EngineError {
                reason: "lstat() failed: No such file or directory.".to_string()
            }
        );
        assert_eq!(
            Parser::parse_scan_reply("INSTREAM size limit exceeded. ERROR"),
            EngineVerdict::EngineError {
                reason: "INSTREAM size limit exceeded.".to_string()
            }
        );
        assert_eq!(
            Parser::parse_scan_reply("ERROR: Access denied"),
            EngineVerdict::EngineError {
                reason: "Access denied".to_string()
            }
        );
    }

    #[test]
    fn test_parse_scan_unexpected_response() {
        match Parser::parse_scan_reply("garbage") {
            EngineVerdict::EngineError { reason } => {
                assert!(reason.contains("Unexpected response"))
            }
            other => panic!("Expected engine error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_database_header() {
        let mut header = String::from(
            "ClamAV-VDB:14 Mar 2023 07-26 -0400:26844:2027291:90:0A1B2C3D4E5F60718293a4b5c6d7e8f9:sig:builder:1678793165",
        );
        header.push_str(&" ".repeat(512 - header.len()));

        let parsed = Parser::parse_database_header(&header).unwrap();
        assert_eq!(parsed.build_time, "14 Mar 2023 07-26 -0400");
        assert_eq!(parsed.version, 26844);
        assert_eq!(parsed.signatures, 2027291);
        assert_eq!(parsed.functionality_level, 90);
        assert_eq!(parsed.md5, "0a1b2c3d4e5f60718293a4b5c6d7e8f9");
    }

    #[test]
    fn test_parse_database_header_rejects_other_files() {
        assert!(Parser::parse_database_header("PK\u{3}\u{4}zip").is_err());
        assert!(Parser::parse_database_header("ClamAV-VDB:date:notanumber:1:1:ab").is_err());
    }
}
