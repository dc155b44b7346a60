use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValuationError {
    #[error("Cyclic metric dependency involving '{0}'")]
    CyclicDependency(String),

    #[error("Metric '{metric}' references unknown metric '{reference}'")]
    UnknownMetricReference { metric: String, reference: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Storage error: {0}")]
    Storage(String),
}
