//! Server-rendered HTML of the single application page.
//!
use crate::config::{
    APP_NAME, COLOR_PRIMARY, COLOR_SECONDARY, COMPANY_NAME, CONFIDENCE_STEP, MAX_CONFIDENCE,
    MIN_CONFIDENCE, VERSION,
};

/// Everything the page shows about the current session.
#[derive(Debug, Default)]
pub struct PageView {
    pub show_logo: bool,
    pub confidence: f32,
    pub upload_name: Option<String>,
    pub count: Option<usize>,
}

/// Render the full page for a session.
pub fn render_page(view: &PageView) -> String {
    let body = match &view.upload_name {
        Some(name) => render_upload(name, view.count),
        None => info("Por favor, carga una imagen para comenzar la detección."),
    };

    layout(&render_sidebar(view), &format!("{}{}", upload_form(view), body))
}

/// Render the page shown when the model could not be loaded. Nothing else is rendered.
pub fn render_model_error(message: &str) -> String {
    let body = format!(
        r#"<div class="warning">No se encontró el modelo o no pudo cargarse. Verifique la ruta.<br><code>{}</code></div>"#,
        escape_html(message)
    );

    layout("", &body)
}

fn layout(sidebar: &str, main: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="es">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{app}</title>
<style>
body {{ margin: 0; font-family: sans-serif; display: flex; min-height: 100vh; }}
aside {{ width: 260px; padding: 20px; background: #f0f2f6; }}
main {{ flex: 1; padding: 20px 40px; }}
h1 {{ color: {primary}; }}
hr {{ border: none; border-top: 1px solid #ddd; margin: 20px 0; }}
.center {{ width: 50%; margin: 0 auto; }}
.button {{ display: block; width: 100%; padding: 10px; border: none; border-radius: 6px;
  background: {primary}; color: white; font-size: 1rem; text-align: center; text-decoration: none; cursor: pointer; }}
.button.secondary {{ background: {secondary}; }}
.metric-container {{ display: flex; justify-content: center; align-items: center; gap: 15px; padding: 20px; font-size: 1.5rem; }}
.metric-label {{ font-weight: bold; font-size: 1.5rem; }}
.metric-value {{ font-size: 2rem; font-weight: bold; color: #1f77b4; }}
.columns {{ display: flex; gap: 20px; }}
.columns > div {{ flex: 1; }}
.columns img {{ width: 100%; }}
.info {{ padding: 12px; border-radius: 6px; background: #e8f0fe; }}
.warning {{ padding: 12px; border-radius: 6px; background: #fff4e5; }}
</style>
</head>
<body>
{sidebar}
<main>
<h1>{app}</h1>
<p><strong>{company}</strong> - Sistema de detección de larvas de chorito asistido por IA.</p>
<hr>
{main}
</main>
</body>
</html>
"#,
        app = APP_NAME,
        company = COMPANY_NAME,
        primary = COLOR_PRIMARY,
        secondary = COLOR_SECONDARY,
        sidebar = sidebar,
        main = main,
    )
}

fn render_sidebar(view: &PageView) -> String {
    let logo = match view.show_logo {
        true => r#"<img src="/logo" width="200" alt="logo">"#,
        false => "",
    };

    format!(
        r#"<aside>
{logo}
<h2>Configuración</h2>
<label for="confidence">Nivel de Confianza: <output id="confidence-value">{confidence:.2}</output></label>
<input type="range" id="confidence" name="confidence" form="detect-form"
  min="{min}" max="{max}" step="{step}" value="{confidence:.2}"
  title="Ajusta el nivel de confianza para la detección de larvas."
  oninput="document.getElementById('confidence-value').value = Number(this.value).toFixed(2)">
<p class="info">Version: {version}<br><br>{company}</p>
</aside>"#,
        logo = logo,
        confidence = view.confidence,
        min = MIN_CONFIDENCE,
        max = MAX_CONFIDENCE,
        step = CONFIDENCE_STEP,
        version = VERSION,
        company = COMPANY_NAME,
    )
}

fn upload_form(view: &PageView) -> String {
    let remove = match view.upload_name {
        Some(_) => {
            r#"<form method="post" action="/remove"><button class="button secondary" type="submit">Quitar imagen</button></form>"#
        }
        None => "",
    };

    format!(
        r#"<div class="center">
<form method="post" action="/upload" enctype="multipart/form-data">
<label for="image">Cargar Imagen</label>
<input type="file" id="image" name="image" accept=".jpg,.jpeg,.png"
  title="Sube una imagen para detectar y contar larvas de chorito." onchange="this.form.submit()">
</form>
{remove}
</div>
"#
    )
}

fn render_upload(name: &str, count: Option<usize>) -> String {
    let mut html = format!(
        r#"<div class="center">
<p>{name}</p>
<form id="detect-form" method="post" action="/detect">
<button class="button" type="submit">Detectar Larvas</button>
</form>
</div>
<hr>
"#,
        name = escape_html(name)
    );

    if let Some(count) = count {
        html.push_str(&format!(
            r#"<div class="center">
<div class="metric-container">
<span class="metric-label">Larvas Detectadas:</span>
<span class="metric-value">{count}</span>
</div>
<a class="button" href="/download">Descargar Resultado</a>
</div>
"#
        ));
    }

    let result = match count {
        Some(_) => r#"<img src="/image/result" alt="resultado">"#.to_owned(),
        None => info("Presiona el botón 'Detectar Larvas' para ver los resultados."),
    };

    html.push_str(&format!(
        r#"<hr>
<div class="columns">
<div><h3>Imagen Original</h3><img src="/image/original" alt="original"></div>
<div><h3>Resultados Detección</h3>{result}</div>
</div>
"#
    ));

    html
}

fn info(text: &str) -> String {
    format!(r#"<p class="info">{}</p>"#, escape_html(text))
}

/// Escape text for use in HTML content and attribute values.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_page_without_upload() {
        let html = render_page(&PageView {
            confidence: 0.25,
            ..Default::default()
        });

        assert!(html.contains("Por favor, carga una imagen"));
        assert!(html.contains(r#"value="0.25""#));
        assert!(!html.contains("Detectar Larvas"));
        assert!(!html.contains("/logo"));
    }

    #[test]
    fn test_page_with_upload_and_result() {
        let html = render_page(&PageView {
            show_logo: true,
            confidence: 0.4,
            upload_name: Some("<muestra>.jpg".into()),
            count: Some(17),
        });

        assert!(html.contains("Detectar Larvas"));
        assert!(html.contains(r#"<span class="metric-value">17</span>"#));
        assert!(html.contains(r#"href="/download""#));
        assert!(html.contains("/image/result"));
        assert!(html.contains("&lt;muestra&gt;.jpg"));
        assert!(html.contains(r#"src="/logo""#));
    }

    #[test]
    fn test_page_with_upload_without_result() {
        let html = render_page(&PageView {
            confidence: 0.25,
            upload_name: Some("muestra.jpg".into()),
            ..Default::default()
        });

        assert!(html.contains("Presiona el botón"));
        assert!(!html.contains("Descargar Resultado"));
    }

    #[test]
    fn test_model_error_page_halts() {
        let html = render_model_error("model file not found: <x>");

        assert!(html.contains("&lt;x&gt;"));
        assert!(!html.contains("Cargar Imagen"));
        assert!(!html.contains("Nivel de Confianza"));
    }
}
