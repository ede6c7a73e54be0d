//! Branding and detection settings of the application.
//!
use std::path::PathBuf;

pub const APP_NAME: &str = "Contador de Larvas de Chorito";
pub const COMPANY_NAME: &str = "St. Andrews";
pub const VERSION: &str = "1.0.0 Web";

pub const DEFAULT_CONFIDENCE: f32 = 0.25;
pub const MIN_CONFIDENCE: f32 = 0.1;
pub const MAX_CONFIDENCE: f32 = 0.9;
pub const CONFIDENCE_STEP: f32 = 0.05;

pub const COLOR_PRIMARY: &str = "#1B4D89";
pub const COLOR_SECONDARY: &str = "#D4A446";

/// JPEG quality of downloaded results.
pub const JPEG_QUALITY: u8 = 95;

/// File extensions accepted by the upload control.
pub const ACCEPTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Runtime settings shared by all request handlers.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub logo_path: Option<PathBuf>,
}

impl AppConfig {
    /// Logo to show in the sidebar, if one is configured and present on disk.
    pub fn existing_logo(&self) -> Option<&PathBuf> {
        self.logo_path.as_ref().filter(|path| path.exists())
    }
}

/// Check that a confidence threshold lies within the range offered by the slider.
pub fn confidence_in_range(confidence: f32) -> bool {
    (MIN_CONFIDENCE..=MAX_CONFIDENCE).contains(&confidence)
}

/// Check whether a file name carries one of the accepted image extensions.
pub fn has_accepted_extension(file_name: &str) -> bool {
    std::path::Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ACCEPTED_EXTENSIONS
                .iter()
                .any(|accepted| ext.eq_ignore_ascii_case(accepted))
        })
        .unwrap_or(false)
}
