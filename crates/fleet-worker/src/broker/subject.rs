//! Subject helpers.

/// Match a subject against a pattern using NATS wildcards: `*` matches one
/// token, a trailing `>` matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match token {
            ">" => return subject_tokens.next().is_some(),
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    subject_tokens.next().is_none()
}

/// Durable consumer name for `prefix` on `hostname`. Durable names may not
/// contain subject separators or wildcards.
pub fn durable_name(prefix: &str, hostname: &str) -> String {
    let host: String = hostname
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | '/' | '\\' => '-',
            c if c.is_whitespace() => '-',
            c => c,
        })
        .collect();
    format!("{prefix}{host}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_subjects() {
        assert!(subject_matches("report", "report"));
        assert!(!subject_matches("report", "reports"));
        assert!(!subject_matches("certificates.user", "certificates"));
    }

    #[test]
    fn single_token_wildcard() {
        assert!(subject_matches("certificates.agent.*", "certificates.agent.A7"));
        assert!(!subject_matches("certificates.agent.*", "certificates.agent"));
        assert!(!subject_matches("certificates.agent.*", "certificates.agent.A7.x"));
    }

    #[test]
    fn tail_wildcard() {
        assert!(subject_matches("notification.>", "notification.confirm_email"));
        assert!(subject_matches("notification.>", "notification.a.b"));
        assert!(!subject_matches("notification.>", "notification"));
    }

    #[test]
    fn durable_name_strips_separators() {
        assert_eq!(
            durable_name("CertManagerConsumer", "worker-1.example.com"),
            "CertManagerConsumerworker-1-example-com"
        );
    }
}
