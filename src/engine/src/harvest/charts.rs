//! Container-image extraction from Helm charts.
//!
//! Every directory under `charts/` carrying `Chart.yaml`, `values.yaml`,
//! and `templates/` is rendered with its default values — `{{ .Values.… }}`
//! expressions substituted from `values.yaml` — and the result is scanned
//! like a manifest. References that still contain template markup after
//! rendering cannot be pulled and are dropped.

use std::path::{Path, PathBuf};

use kubeimage_core::{EngineError, Result};
use serde_yaml::Value;
use tracing::warn;

use super::manifests::images_from_yaml_text;
use super::CHARTS_DIR;

/// Scan `tree/charts` for container-image references.
pub fn scan_charts(tree: &Path) -> Result<Vec<String>> {
    let dir = tree.join(CHARTS_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut chart_dirs = Vec::new();
    find_chart_dirs(&dir, &mut chart_dirs)?;
    chart_dirs.sort();

    let mut images = Vec::new();
    for chart in chart_dirs {
        images.extend(scan_chart(&chart)?);
    }
    Ok(images)
}

fn find_chart_dirs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if dir.join("Chart.yaml").is_file()
        && dir.join("values.yaml").is_file()
        && dir.join("templates").is_dir()
    {
        out.push(dir.to_path_buf());
        // subcharts still live under charts/ of their parent
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && path.file_name().map(|n| n != "templates").unwrap_or(true) {
            find_chart_dirs(&path, out)?;
        }
    }
    Ok(())
}

fn scan_chart(chart: &Path) -> Result<Vec<String>> {
    let values_text = std::fs::read_to_string(chart.join("values.yaml")).map_err(|e| {
        EngineError::Storage(format!(
            "cannot read values of chart {}: {}",
            chart.display(),
            e
        ))
    })?;
    let values: Value = serde_yaml::from_str(&values_text).map_err(|e| {
        EngineError::Storage(format!(
            "invalid values.yaml in chart {}: {}",
            chart.display(),
            e
        ))
    })?;

    let mut images = Vec::new();
    let mut templates = Vec::new();
    collect_templates(&chart.join("templates"), &mut templates)?;
    templates.sort();

    for template in templates {
        let text = std::fs::read_to_string(&template)?;
        let rendered = render_values(&text, &values);
        for image in images_from_yaml_text(&rendered) {
            if image.contains("{{") {
                warn!(chart = %chart.display(), image = %image, "unresolved template expression, skipping reference");
                continue;
            }
            images.push(image);
        }
    }
    Ok(images)
}

fn collect_templates(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_templates(&path, out)?;
        } else {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase)
                .unwrap_or_default();
            if ext == "yaml" || ext == "yml" || ext == "tpl" || ext == "tmpl" {
                out.push(path);
            }
        }
    }
    Ok(())
}

/// Substitute `{{ .Values.a.b }}` expressions with chart default values.
///
/// Expressions that do not resolve (pipelines, functions, missing keys)
/// are left in place; the caller filters references that kept markup.
fn render_values(text: &str, values: &Value) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let expr = after[..end].trim().trim_start_matches('-').trim();
        match lookup_values(expr, values) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn lookup_values(expr: &str, values: &Value) -> Option<String> {
    let path = expr.strip_prefix(".Values.")?;
    // a pipeline or function call is not a plain lookup
    if path.contains(' ') || path.contains('|') {
        return None;
    }
    let mut current = values;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_chart(root: &Path, name: &str, values: &str, template: &str) {
        let chart = root.join(CHARTS_DIR).join(name);
        std::fs::create_dir_all(chart.join("templates")).unwrap();
        std::fs::write(chart.join("Chart.yaml"), format!("name: {name}\n")).unwrap();
        std::fs::write(chart.join("values.yaml"), values).unwrap();
        std::fs::write(chart.join("templates/deploy.yaml"), template).unwrap();
    }

    #[test]
    fn test_scan_chart_with_default_values() {
        let tmp = TempDir::new().unwrap();
        write_chart(
            tmp.path(),
            "app",
            "image:\n  repository: myorg/app\n  tag: v2.1.0\n",
            "spec:\n  containers:\n    - name: app\n      image: \"{{ .Values.image.repository }}:{{ .Values.image.tag }}\"\n",
        );

        let images = scan_charts(tmp.path()).unwrap();
        assert_eq!(images, vec!["myorg/app:v2.1.0"]);
    }

    #[test]
    fn test_scan_literal_image() {
        let tmp = TempDir::new().unwrap();
        write_chart(
            tmp.path(),
            "app",
            "replicas: 1\n",
            "spec:\n  containers:\n    - image: redis:6.2\n",
        );
        assert_eq!(scan_charts(tmp.path()).unwrap(), vec!["redis:6.2"]);
    }

    #[test]
    fn test_unresolved_reference_dropped() {
        let tmp = TempDir::new().unwrap();
        write_chart(
            tmp.path(),
            "app",
            "other: 1\n",
            "spec:\n  containers:\n    - image: \"{{ .Values.image.repository }}:latest\"\n",
        );
        assert!(scan_charts(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_directory_without_chart_files_ignored() {
        let tmp = TempDir::new().unwrap();
        let not_a_chart = tmp.path().join(CHARTS_DIR).join("docs");
        std::fs::create_dir_all(&not_a_chart).unwrap();
        std::fs::write(not_a_chart.join("README.yaml"), "image: nope:1\n").unwrap();
        assert!(scan_charts(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_no_charts_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(scan_charts(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_render_values_nested_lookup() {
        let values: Value =
            serde_yaml::from_str("image:\n  tag: v1\nport: 8080\ndebug: false\n").unwrap();
        assert_eq!(
            render_values("tag={{ .Values.image.tag }} port={{ .Values.port }}", &values),
            "tag=v1 port=8080"
        );
        assert_eq!(render_values("d={{ .Values.debug }}", &values), "d=false");
    }

    #[test]
    fn test_render_values_leaves_unknown_expressions() {
        let values: Value = serde_yaml::from_str("a: 1").unwrap();
        assert_eq!(
            render_values("x={{ include \"app.name\" . }}", &values),
            "x={{ include \"app.name\" . }}"
        );
        assert_eq!(
            render_values("y={{ .Values.missing.key }}", &values),
            "y={{ .Values.missing.key }}"
        );
    }

    #[test]
    fn test_render_values_unterminated_expression() {
        let values: Value = serde_yaml::from_str("a: 1").unwrap();
        assert_eq!(render_values("x={{ .Values.a", &values), "x={{ .Values.a");
    }
}
