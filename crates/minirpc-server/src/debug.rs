//! Debug page listing every registered service, method and call count.
//!
//! The page is a minijinja template rendered into a buffer from a registry
//! snapshot and sent as a whole. The template name ends in `.html`, so every
//! interpolated name is HTML-escaped. A render failure never changes the
//! status: the error text is appended after whatever was rendered.

use crate::http::AppState;
use axum::{extract::State, response::Html};
use minijinja::{context, Environment, UndefinedBehavior};
use minirpc_core::ServiceSnapshot;
use std::sync::Arc;
use tracing::warn;

const PAGE_NAME: &str = "debug.html";

const PAGE_TEMPLATE: &str = r#"<html>
<head><title>minirpc services</title></head>
<body>
{% for service in services %}
<hr>
Service {{ service.name }}
<hr>
<table>
<tr><th align=center>Method</th><th align=center>Argument</th><th align=center>Reply</th><th align=center>Calls</th></tr>
{% for method in service.methods %}
<tr><td align=left>{{ method.name }}</td><td align=left>{{ method.arg_shape }}</td><td align=left>{{ method.reply_shape }}</td><td align=center>{{ method.num_calls }}</td></tr>
{% endfor %}
</table>
{% endfor %}
</body>
</html>
"#;

/// GET handler for the debug path.
pub async fn handle_debug(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(render_debug_page(&state.registry.snapshot()))
}

/// Render the full page for `services`.
pub fn render_debug_page(services: &[ServiceSnapshot]) -> String {
    render_page(PAGE_TEMPLATE, services)
}

fn page_environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

fn render_page(source: &str, services: &[ServiceSnapshot]) -> String {
    let env = page_environment();
    let mut out = Vec::new();
    let rendered = env
        .template_from_named_str(PAGE_NAME, source)
        .and_then(|page| page.render_to_write(context! { services => services }, &mut out).map(|_| ()));

    let mut page = String::from_utf8_lossy(&out).into_owned();
    if let Err(e) = rendered {
        warn!("Debug page render failed: {}", e);
        page.push_str(&format!("rpc: error rendering debug page: {}\n", e));
    }
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use minirpc_core::MethodSnapshot;

    fn services() -> Vec<ServiceSnapshot> {
        vec![ServiceSnapshot {
            name: "Calc".into(),
            methods: vec![MethodSnapshot {
                name: "Add".into(),
                arg_shape: "demo::Args".into(),
                reply_shape: "Vec<i64>".into(),
                num_calls: 3,
            }],
        }]
    }

    #[test]
    fn test_page_lists_methods() {
        let page = render_debug_page(&services());
        assert!(page.starts_with("<html>"));
        assert!(page.contains("Service Calc"));
        assert!(page.contains("<td align=left>Add</td>"));
        assert!(page.contains("<td align=left>demo::Args</td>"));
        assert!(page.contains("<td align=center>3</td>"));
        assert!(page.trim_end().ends_with("</html>"));
        assert!(!page.contains("rpc: error rendering debug page"));
    }

    #[test]
    fn test_shape_names_are_escaped() {
        let page = render_debug_page(&services());
        assert!(page.contains("Vec&lt;i64&gt;"));
        assert!(!page.contains("Vec<i64>"));
    }

    #[test]
    fn test_empty_registry_renders_shell() {
        let page = render_debug_page(&[]);
        assert!(page.contains("<body>"));
        assert!(!page.contains("Service "));
    }

    #[test]
    fn test_render_failure_appends_error_text() {
        let broken = "<html>\n{% for service in services %}{{ service.owner }}{% endfor %}</html>\n";
        let page = render_page(broken, &services());

        assert!(page.starts_with("<html>"));
        assert!(page.contains("rpc: error rendering debug page"));
        assert!(!page.contains("</html>"));
    }
}
