use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
	#[error("invalid configuration: {0}")]
	Config(String),
	#[error("failed to parse configuration: {0}")]
	Yaml(#[from] serde_yaml::Error),
	#[error(transparent)]
	Selector(#[from] selector::Error),
	#[error("cluster access failed: {0}")]
	ClusterAccess(String),
	#[error("kube error: {0}")]
	Kube(#[from] kube::Error),
	#[error("watch failed: {0}")]
	Watch(String),
	#[error("metrics error: {0}")]
	Metrics(#[from] prometheus::Error),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}
pub type Result<T> = std::result::Result<T, Error>;
