pub mod bedrock;
pub mod java;
pub mod proxy_protocol;
