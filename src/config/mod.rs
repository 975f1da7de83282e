pub mod settings;

pub use settings::{
    PromptPatterns, SessionConfig, DEFAULT_LOGIN_PROMPT, DEFAULT_PASSWORD_PROMPT,
    DEFAULT_SHELL_PROMPT,
};
