use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LbError {
    #[error("failover transition undefined for mode '{0}'")]
    FailoverTransition(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_names_the_mode() {
        let e = LbError::FailoverTransition("unknown");
        assert!(e.to_string().contains("unknown"));
    }
}
