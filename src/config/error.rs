use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("server '{id}' uses the stdio transport but has no command")]
    MissingCommand { id: String },
    #[error("server '{id}' uses the sse transport but has no url")]
    MissingUrl { id: String },
    #[error("failed to parse descriptor document: {source}")]
    Parse {
        #[from]
        source: toml::de::Error,
    },
}
