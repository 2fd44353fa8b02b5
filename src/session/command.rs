//! Dev-server command templates.

use crate::error::PreviewError;
use std::path::Path;
use tokio::process::Command;

/// Default command used to serve a generated project.
pub const DEFAULT_DEV_COMMAND: &str = "npm run dev -- --port {port}";

const PORT_PLACEHOLDER: &str = "{port}";

/// Shell-style command line with a `{port}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevCommand {
    template: String,
}

impl DevCommand {
    /// Parse a template, rejecting empty or unbalanced command lines.
    pub fn parse(template: &str) -> Result<Self, PreviewError> {
        let words = shlex::split(template)
            .ok_or_else(|| PreviewError::InvalidCommand(format!("unbalanced quotes: {template}")))?;
        if words.is_empty() {
            return Err(PreviewError::InvalidCommand("empty command".to_string()));
        }
        Ok(Self {
            template: template.to_string(),
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Program and arguments with the port substituted.
    pub fn argv(&self, port: u16) -> Vec<String> {
        let rendered = self.template.replace(PORT_PLACEHOLDER, &port.to_string());
        shlex::split(&rendered).unwrap_or_default()
    }

    /// Build the process command for `port`, run from `cwd`.
    ///
    /// The parent environment is inherited; `PORT` and `HOST` are injected so
    /// dev servers that read them bind to the assigned port too.
    pub fn build(&self, port: u16, bind_host: &str, cwd: &Path) -> Result<Command, PreviewError> {
        let argv = self.argv(port);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PreviewError::InvalidCommand(self.template.clone()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .env("PORT", port.to_string())
            .env("HOST", bind_host)
            .env("BROWSER", "none");
        Ok(cmd)
    }
}

impl Default for DevCommand {
    fn default() -> Self {
        Self {
            template: DEFAULT_DEV_COMMAND.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_port() {
        let cmd = DevCommand::default();
        assert_eq!(
            cmd.argv(3002),
            vec!["npm", "run", "dev", "--", "--port", "3002"]
        );
    }

    #[test]
    fn keeps_quoted_arguments_together() {
        let cmd = DevCommand::parse("sh -c 'echo ready on {port}; exec sleep 30'").unwrap();
        assert_eq!(
            cmd.argv(3005),
            vec!["sh", "-c", "echo ready on 3005; exec sleep 30"]
        );
    }

    #[test]
    fn rejects_bad_templates() {
        assert!(matches!(
            DevCommand::parse("   "),
            Err(PreviewError::InvalidCommand(_))
        ));
        assert!(matches!(
            DevCommand::parse("sh -c 'unterminated"),
            Err(PreviewError::InvalidCommand(_))
        ));
    }

    #[test]
    fn build_sets_cwd_and_port_env() {
        let cmd = DevCommand::parse("vite --port {port}").unwrap();
        let built = cmd.build(3003, "127.0.0.1", Path::new("/tmp")).unwrap();
        let std_cmd = built.as_std();
        assert_eq!(std_cmd.get_program(), "vite");
        assert_eq!(std_cmd.get_current_dir(), Some(Path::new("/tmp")));
        let port_env = std_cmd
            .get_envs()
            .find(|(k, _)| *k == "PORT")
            .and_then(|(_, v)| v);
        assert_eq!(port_env, Some(std::ffi::OsStr::new("3003")));
    }
}
