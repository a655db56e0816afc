use std::path::{Path, PathBuf};

use crate::analyzer::CompileInputSet;
use crate::backend::Artifact;
use crate::config::ToolchainConfig;

#[derive(Debug, Clone)]
pub struct BuildStep {
    pub description: String,
    pub commands: Vec<String>,
}

impl BuildStep {
    pub fn new(description: String, commands: Vec<String>) -> Self {
        Self {
            description,
            commands,
        }
    }
}

impl std::fmt::Display for BuildStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.description)?;
        writeln!(f, "  {}", self.commands.join(" "))?;
        Ok(())
    }
}

/// Expands the configured compile and run command templates.
///
/// Recognized placeholders: `{project}` (project directory), `{artifact}`
/// (artifact path) and `{sources}`. An argument that is exactly `{sources}`
/// becomes one argument per source file; elsewhere the sources are joined
/// with spaces.
#[derive(Debug, Clone)]
pub struct Toolchain {
    compile: Vec<String>,
    run: Vec<String>,
    artifact_dir: String,
    artifact_name: String,
}

impl Toolchain {
    pub fn new(
        compile: Vec<String>,
        run: Vec<String>,
        artifact_dir: String,
        artifact_name: String,
    ) -> Self {
        Self {
            compile,
            run,
            artifact_dir,
            artifact_name,
        }
    }

    pub fn from_config(config: &ToolchainConfig) -> Self {
        Self::new(
            config.compile.clone(),
            config.run.clone(),
            config.artifact_dir.clone(),
            config.artifact_name.clone(),
        )
    }

    pub fn artifact_dir(&self) -> &str {
        &self.artifact_dir
    }

    pub fn artifact_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.artifact_dir).join(&self.artifact_name)
    }

    pub fn compile_step(&self, project_dir: &Path, sources: &CompileInputSet) -> BuildStep {
        let artifact = self.artifact_path(project_dir);
        let sources: Vec<String> = sources
            .iter()
            .map(|path| path.display().to_string())
            .collect();

        BuildStep::new(
            format!("Compiling {}", project_dir.display()),
            expand(&self.compile, project_dir, &artifact, &sources),
        )
    }

    pub fn run_step(&self, artifact: &Artifact) -> BuildStep {
        BuildStep::new(
            format!("Running {}", artifact.path.display()),
            expand(&self.run, &artifact.project_dir, &artifact.path, &[]),
        )
    }
}

fn expand(template: &[String], project: &Path, artifact: &Path, sources: &[String]) -> Vec<String> {
    let project = project.display().to_string();
    let artifact = artifact.display().to_string();
    let joined = sources.join(" ");

    let mut cmd = Vec::with_capacity(template.len() + sources.len());
    for arg in template {
        if arg == "{sources}" {
            cmd.extend_from_slice(sources);
            continue;
        }

        cmd.push(
            arg.replace("{project}", &project)
                .replace("{artifact}", &artifact)
                .replace("{sources}", &joined),
        );
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolchain() -> Toolchain {
        Toolchain::new(
            vec![
                "cc".to_string(),
                "-o".to_string(),
                "{artifact}".to_string(),
                "{sources}".to_string(),
            ],
            vec!["sh".to_string(), "-c".to_string(), "cd {project} && {artifact}".to_string()],
            "build".to_string(),
            "app".to_string(),
        )
    }

    #[test]
    fn test_compile_step_splices_sources() {
        let sources = CompileInputSet::new(vec![
            PathBuf::from("/p/a.c"),
            PathBuf::from("/p/b.c"),
        ]);
        let step = toolchain().compile_step(Path::new("/p"), &sources);

        assert_eq!(
            step.commands,
            vec!["cc", "-o", "/p/build/app", "/p/a.c", "/p/b.c"]
        );
    }

    #[test]
    fn test_embedded_placeholders_are_replaced() {
        let artifact = Artifact {
            path: PathBuf::from("/p/build/app"),
            project_dir: PathBuf::from("/p"),
        };
        let step = toolchain().run_step(&artifact);

        assert_eq!(step.commands, vec!["sh", "-c", "cd /p && /p/build/app"]);
    }

    #[test]
    fn test_joined_sources_inside_argument() {
        let chain = Toolchain::new(
            vec!["sh".to_string(), "-c".to_string(), "cat {sources} > {artifact}".to_string()],
            vec![],
            "out".to_string(),
            "bin".to_string(),
        );
        let sources = CompileInputSet::new(vec![PathBuf::from("/p/a.sh"), PathBuf::from("/p/b.sh")]);
        let step = chain.compile_step(Path::new("/p"), &sources);

        assert_eq!(step.commands[2], "cat /p/a.sh /p/b.sh > /p/out/bin");
    }
}
