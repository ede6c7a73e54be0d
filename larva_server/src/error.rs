//! Errors reported to the browser.
//!
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::config::{MAX_CONFIDENCE, MIN_CONFIDENCE};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("El modelo no está disponible: {0}")]
    ModelUnavailable(String),
    #[error("Formato no soportado: {0}. Use jpg, jpeg o png.")]
    UnsupportedFormat(String),
    #[error("No se pudo leer la imagen: {0}")]
    InvalidImage(String),
    #[error("Confianza fuera de rango: {0} (permitido {min} a {max})", min = MIN_CONFIDENCE, max = MAX_CONFIDENCE)]
    InvalidConfidence(f32),
    #[error("Primero cargue una imagen.")]
    NoUpload,
    #[error("No encontrado.")]
    NotFound,
    #[error("Error interno: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnsupportedFormat(_)
            | Self::InvalidImage(_)
            | Self::InvalidConfidence(_)
            | Self::NoUpload => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{self}");
        } else {
            log::warn!("{self}");
        }

        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::ModelUnavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(AppError::InvalidConfidence(2.0).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
