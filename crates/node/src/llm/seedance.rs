use super::openai_compat::{ChatCompletionsAdapter, Flavor};
use super::AdapterOptions;
use crate::error::NodeError;

pub const NAME: &str = "seedance";
pub const DEFAULT_BASE_URL: &str = "https://api.seedance.io/v1";

const FLAVOR: Flavor = Flavor {
    name: NAME,
    default_base_url: DEFAULT_BASE_URL,
    supported_models: &["seedance-large", "seedance-medium", "seedance-small"],
};

pub fn adapter(api_key: &str, options: AdapterOptions) -> Result<ChatCompletionsAdapter, NodeError> {
    ChatCompletionsAdapter::new(FLAVOR, api_key, options)
}
