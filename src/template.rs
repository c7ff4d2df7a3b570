//! Handlebars template expansion for configuration-managed files.

use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use handlebars::Handlebars;
use std::fs;
use std::path::Path;

/// Renders a template string against the given environment.
///
/// Strict mode is on: referencing a variable missing from the environment
/// is an error instead of silently expanding to nothing.
pub(crate) fn expand_str(template: &str, env: &serde_json::Value) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars
        .render_template(template, env)
        .wrap_err("Failed to render template")
}

/// Renders a template file into `dst`.
pub(crate) fn expand_file(src: &Path, dst: &Path, env: &serde_json::Value) -> Result<()> {
    let template = fs::read_to_string(src)
        .wrap_err_with(|| format!("Failed to read template {}", src.display()))?;
    let rendered = expand_str(&template, env)
        .wrap_err_with(|| format!("Failed to render template {}", src.display()))?;
    fs::write(dst, rendered)
        .wrap_err_with(|| format!("Failed to write rendered template {}", dst.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expand_str() {
        let env = json!({"user": "deploy", "port": 8125});
        let out = expand_str("listen {{user}}:{{port}}", &env).unwrap();
        assert_eq!(out, "listen deploy:8125");
    }

    #[test]
    fn test_strict_mode_rejects_missing_vars() {
        let env = json!({});
        assert!(expand_str("{{nope}}", &env).is_err());
    }

    #[test]
    fn test_expand_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("unit.tmpl");
        let dst = dir.path().join("unit.conf");
        fs::write(&src, "name = {{name}}\n")?;
        expand_file(&src, &dst, &json!({"name": "netprobe"}))?;
        assert_eq!(fs::read_to_string(&dst)?, "name = netprobe\n");
        Ok(())
    }
}
