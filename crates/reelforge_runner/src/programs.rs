//! The closed set of external pipeline programs.
//!
//! Each variant knows its script name, its timeout and the stderr patterns
//! that mark a failure as permanent (retrying cannot help). Argv shapes are
//! built here so every call site produces the same command lines.

use std::path::Path;
use std::time::Duration;

/// Default wall-clock timeout for a pipeline program.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalProgram {
    GenerateAsset,
    CreateComposite,
    CreateSplitScreen,
    GenerateVideo,
    GenerateAudio,
    GenerateSoundEffects,
    AssembleVideo,
}

impl ExternalProgram {
    pub const ALL: &'static [ExternalProgram] = &[
        ExternalProgram::GenerateAsset,
        ExternalProgram::CreateComposite,
        ExternalProgram::CreateSplitScreen,
        ExternalProgram::GenerateVideo,
        ExternalProgram::GenerateAudio,
        ExternalProgram::GenerateSoundEffects,
        ExternalProgram::AssembleVideo,
    ];

    /// File name under the `scripts/` directory.
    pub fn script_name(&self) -> &'static str {
        match self {
            ExternalProgram::GenerateAsset => "generate_asset",
            ExternalProgram::CreateComposite => "create_composite",
            ExternalProgram::CreateSplitScreen => "create_split_screen",
            ExternalProgram::GenerateVideo => "generate_video",
            ExternalProgram::GenerateAudio => "generate_audio",
            ExternalProgram::GenerateSoundEffects => "generate_sound_effects",
            ExternalProgram::AssembleVideo => "assemble_video",
        }
    }

    pub fn timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    /// Stderr substrings that mark a non-zero exit as permanent.
    pub fn permanent_stderr_patterns(&self) -> &'static [&'static str] {
        match self {
            ExternalProgram::GenerateAsset => &["invalid prompt", "content policy violation"],
            ExternalProgram::CreateComposite | ExternalProgram::CreateSplitScreen => {
                &["corrupt input image", "unsupported image format"]
            }
            ExternalProgram::GenerateVideo => {
                &["invalid prompt", "content policy violation", "unsupported resolution"]
            }
            ExternalProgram::GenerateAudio => &["unsupported voice", "empty narration text"],
            ExternalProgram::GenerateSoundEffects => &["invalid effect description"],
            ExternalProgram::AssembleVideo => &["missing clip", "codec not available"],
        }
    }

    /// Whether a failure with this stderr is permanent for this program.
    pub fn is_permanent_failure(&self, stderr: &str) -> bool {
        let lowered = stderr.to_ascii_lowercase();
        self.permanent_stderr_patterns()
            .iter()
            .any(|pattern| lowered.contains(pattern))
    }
}

/// One concrete program call: the variant plus its built argv.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: ExternalProgram,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn generate_asset(kind: &str, index: usize, prompt: &str, out: &Path) -> Invocation {
        Invocation {
            program: ExternalProgram::GenerateAsset,
            args: vec![
                "--kind".into(),
                kind.to_string(),
                "--slot".into(),
                index.to_string(),
                "--prompt".into(),
                prompt.to_string(),
                "--out".into(),
                path_arg(out),
            ],
        }
    }

    pub fn create_composite(scene: usize, assets_dir: &Path, out: &Path) -> Invocation {
        Invocation {
            program: ExternalProgram::CreateComposite,
            args: vec![
                "--scene".into(),
                scene.to_string(),
                "--assets-dir".into(),
                path_arg(assets_dir),
                "--out".into(),
                path_arg(out),
            ],
        }
    }

    pub fn create_split_screen(scene: usize, assets_dir: &Path, out: &Path) -> Invocation {
        Invocation {
            program: ExternalProgram::CreateSplitScreen,
            args: vec![
                "--scene".into(),
                scene.to_string(),
                "--assets-dir".into(),
                path_arg(assets_dir),
                "--out".into(),
                path_arg(out),
            ],
        }
    }

    pub fn generate_video(scene: usize, composite: &Path, prompt: &str, out: &Path) -> Invocation {
        Invocation {
            program: ExternalProgram::GenerateVideo,
            args: vec![
                "--scene".into(),
                scene.to_string(),
                "--composite".into(),
                path_arg(composite),
                "--prompt".into(),
                prompt.to_string(),
                "--out".into(),
                path_arg(out),
            ],
        }
    }

    pub fn generate_audio(
        scene: usize,
        text: &str,
        voice_id: Option<&str>,
        out: &Path,
    ) -> Invocation {
        let mut args = vec![
            "--scene".into(),
            scene.to_string(),
            "--text".into(),
            text.to_string(),
        ];
        if let Some(voice) = voice_id {
            args.push("--voice".into());
            args.push(voice.to_string());
        }
        args.push("--out".into());
        args.push(path_arg(out));
        Invocation {
            program: ExternalProgram::GenerateAudio,
            args,
        }
    }

    pub fn generate_sound_effects(scene: usize, prompt: &str, out: &Path) -> Invocation {
        Invocation {
            program: ExternalProgram::GenerateSoundEffects,
            args: vec![
                "--scene".into(),
                scene.to_string(),
                "--prompt".into(),
                prompt.to_string(),
                "--out".into(),
                path_arg(out),
            ],
        }
    }

    pub fn assemble_video(
        project_dir: &Path,
        intro: Option<&Path>,
        outro: Option<&Path>,
        out: &Path,
    ) -> Invocation {
        let mut args = vec!["--project-dir".into(), path_arg(project_dir)];
        if let Some(intro) = intro {
            args.push("--intro".into());
            args.push(path_arg(intro));
        }
        if let Some(outro) = outro {
            args.push("--outro".into());
            args.push(path_arg(outro));
        }
        args.push("--out".into());
        args.push(path_arg(out));
        Invocation {
            program: ExternalProgram::AssembleVideo,
            args,
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn permanent_patterns_match_case_insensitively() {
        let program = ExternalProgram::GenerateAudio;
        assert!(program.is_permanent_failure("ERROR: Unsupported Voice 'xq-2'"));
        assert!(!program.is_permanent_failure("connection timed out"));
    }

    #[test]
    fn every_program_has_a_script_name_and_patterns() {
        for program in ExternalProgram::ALL {
            assert!(!program.script_name().is_empty());
            assert!(!program.permanent_stderr_patterns().is_empty());
        }
    }

    #[test]
    fn narration_voice_is_optional() {
        let out = PathBuf::from("/w/audio/narration_03.mp3");
        let with_voice = Invocation::generate_audio(3, "hello", Some("nova"), &out);
        assert!(with_voice.args.contains(&"--voice".to_string()));
        assert!(with_voice.args.contains(&"nova".to_string()));

        let without = Invocation::generate_audio(3, "hello", None, &out);
        assert!(!without.args.contains(&"--voice".to_string()));
    }

    #[test]
    fn assemble_includes_branding_only_when_configured() {
        let out = PathBuf::from("/w/p_final.mp4");
        let project = PathBuf::from("/w");
        let intro = PathBuf::from("/b/intro.mp4");
        let inv = Invocation::assemble_video(&project, Some(&intro), None, &out);
        assert!(inv.args.contains(&"--intro".to_string()));
        assert!(!inv.args.contains(&"--outro".to_string()));
    }
}
