use std::{env, fs, path::PathBuf};

use anyhow::{bail, Context, Result};
use shelf_daemon::server::docs::ApiDoc;
use utoipa::OpenApi;

/// Writes the API description as YAML (default) or JSON, to a file or stdout.
///
/// Usage: `export-openapi [--json] [OUTPUT]`
fn main() -> Result<()> {
    let mut as_json = false;
    let mut output: Option<PathBuf> = None;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--json" => as_json = true,
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            path if output.is_none() => output = Some(PathBuf::from(path)),
            extra => bail!("unexpected argument {extra}"),
        }
    }

    let openapi = ApiDoc::openapi();
    let rendered = if as_json {
        openapi
            .to_pretty_json()
            .context("failed to render OpenAPI as JSON")?
    } else {
        openapi.to_yaml().context("failed to render OpenAPI as YAML")?
    };

    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(&path, rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        None => println!("{rendered}"),
    }

    Ok(())
}
