pub mod validation;

pub use validation::{OAuthPayload, ValidatedJson, ValidatedPayload};
