use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Session already disposed")]
    Disposed,

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] core_dispatch::DispatchError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] core_dispatch::FetchError),

    #[error("Host bridge error: {0}")]
    Bridge(#[from] bridge_traits::BridgeError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
