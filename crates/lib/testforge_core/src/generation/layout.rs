//! Language detection and test file placement.
//!
//! Jobs key everything by source path; only the publish step needs to know
//! where the test for a source file lives in the repository.

/// Source language, inferred from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    TypeScript,
    JavaScript,
    Python,
    Java,
    Go,
    Ruby,
    CSharp,
    Rust,
    Text,
}

impl Language {
    pub fn from_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        let ext = lower.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        match ext {
            "ts" | "tsx" => Language::TypeScript,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "py" => Language::Python,
            "java" => Language::Java,
            "go" => Language::Go,
            "rb" => Language::Ruby,
            "cs" => Language::CSharp,
            "rs" => Language::Rust,
            _ => Language::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::TypeScript => "typescript",
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Java => "java",
            Language::Go => "go",
            Language::Ruby => "ruby",
            Language::CSharp => "csharp",
            Language::Rust => "rust",
            Language::Text => "text",
        }
    }

    /// Test framework the generated file targets.
    pub fn framework(&self) -> &'static str {
        match self {
            Language::TypeScript | Language::JavaScript | Language::Text => "jest",
            Language::Python => "pytest",
            Language::Java => "junit",
            Language::Go => "go_testing",
            Language::Ruby => "rspec",
            Language::CSharp => "nunit",
            Language::Rust => "cargo_test",
        }
    }
}

fn split_dir(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", path),
    }
}

fn split_ext(file: &str) -> (&str, Option<&str>) {
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file, None),
    }
}

fn join(dir: &str, file: &str) -> String {
    if dir.is_empty() {
        file.to_string()
    } else {
        format!("{dir}/{file}")
    }
}

fn upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Repository path of the test file covering `source_path`.
///
/// Follows each ecosystem's convention: `test_x.py` next to `x.py`,
/// `x.test.ts` next to `x.ts`, `x_test.go`, `XTest.java` under `src/test`,
/// `spec/x_spec.rb`, `XTests.cs`, and `tests/x.rs` for Rust crates.
pub fn test_path_for(source_path: &str) -> String {
    let path = source_path.trim_start_matches('/');
    let (dir, file) = split_dir(path);
    let (stem, ext) = split_ext(file);
    match Language::from_path(path) {
        Language::Python => join(dir, &format!("test_{stem}.py")),
        Language::TypeScript | Language::JavaScript => {
            join(dir, &format!("{stem}.test.{}", ext.unwrap_or("js")))
        }
        Language::Go => join(dir, &format!("{stem}_test.go")),
        Language::Java => {
            let test_dir = match dir.strip_prefix("src/main/") {
                Some(rest) => format!("src/test/{rest}"),
                None if dir == "src/main" => "src/test".to_string(),
                None => dir.to_string(),
            };
            join(&test_dir, &format!("{}Test.java", upper_first(stem)))
        }
        Language::Ruby => {
            let spec_dir = if dir == "lib" || dir.is_empty() {
                "spec".to_string()
            } else {
                match dir.strip_prefix("lib/") {
                    Some(rest) => format!("spec/{rest}"),
                    None => format!("spec/{dir}"),
                }
            };
            join(&spec_dir, &format!("{stem}_spec.rb"))
        }
        Language::CSharp => join(dir, &format!("{}Tests.cs", upper_first(stem))),
        Language::Rust => {
            let crate_root = dir
                .strip_suffix("/src")
                .or_else(|| (dir == "src").then_some(""))
                .unwrap_or(dir);
            join(&join(crate_root, "tests"), &format!("{stem}.rs"))
        }
        Language::Text => match ext {
            Some(ext) => join(dir, &format!("{stem}.test.{ext}")),
            None => join(dir, &format!("{stem}.test")),
        },
    }
}
