use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Tool, ToolOutput, parse_args};
use crate::agent::sandbox::{CapturedOutput, Sandbox, shell_quote};
use crate::errors::ToolFailure;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
struct FileEntry {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct ReadArgs {
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListArgs {
    #[serde(default = "default_list_path")]
    path: String,
}

fn default_list_path() -> String {
    ".".to_string()
}

/// Writes files in list order, stopping at the first failure.
pub struct CreateOrUpdateFiles;

#[async_trait]
impl Tool for CreateOrUpdateFiles {
    fn name(&self) -> &'static str {
        "createOrUpdateFiles"
    }

    fn description(&self) -> &'static str {
        "Create or update files in the sandbox"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "files": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "path": {"type": "string"},
                            "content": {"type": "string"}
                        },
                        "required": ["path", "content"]
                    }
                }
            },
            "required": ["files"]
        })
    }

    async fn call(&self, sandbox: &dyn Sandbox, args: Value) -> Result<ToolOutput, ToolFailure> {
        let args: WriteArgs = parse_args(self.name(), args)?;
        let mut written = Vec::with_capacity(args.files.len());
        for file in args.files {
            if let Err(source) = sandbox.write_file(&file.path, &file.content).await {
                return Err(ToolFailure::Write {
                    path: file.path,
                    written,
                    source,
                });
            }
            written.push((file.path, file.content));
        }
        let paths: Vec<&str> = written.iter().map(|(p, _)| p.as_str()).collect();
        let text = format!(
            "Created or updated {} file(s): {}",
            written.len(),
            paths.join(", ")
        );
        Ok(ToolOutput { text, written })
    }
}

/// Reads files and returns them as a JSON array of `{path, content}`.
pub struct ReadFiles;

#[async_trait]
impl Tool for ReadFiles {
    fn name(&self) -> &'static str {
        "readFiles"
    }

    fn description(&self) -> &'static str {
        "Read files from the sandbox"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "files": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["files"]
        })
    }

    async fn call(&self, sandbox: &dyn Sandbox, args: Value) -> Result<ToolOutput, ToolFailure> {
        let args: ReadArgs = parse_args(self.name(), args)?;
        let mut contents = Vec::with_capacity(args.files.len());
        for path in args.files {
            match sandbox.read_file(&path).await {
                Ok(content) => contents.push(FileEntry { path, content }),
                Err(source) => return Err(ToolFailure::Read { path, source }),
            }
        }
        Ok(ToolOutput::text(json!(contents).to_string()))
    }
}

/// `ls -la` of a directory.
pub struct ListDirectory;

#[async_trait]
impl Tool for ListDirectory {
    fn name(&self) -> &'static str {
        "listDirectory"
    }

    fn description(&self) -> &'static str {
        "List the contents of a directory in the sandbox"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory to list, defaults to \".\""}
            }
        })
    }

    async fn call(&self, sandbox: &dyn Sandbox, args: Value) -> Result<ToolOutput, ToolFailure> {
        let args: ListArgs = parse_args(self.name(), args)?;
        let command = format!("ls -la {}", shell_quote(&args.path));
        let mut capture = CapturedOutput::default();
        sandbox
            .run_command(&command, &mut capture)
            .await
            .map(|out| ToolOutput::text(out.stdout))
            .map_err(|source| ToolFailure::List { source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::MemorySandbox;

    #[tokio::test]
    async fn test_write_then_read_round_trips() {
        let sandbox = MemorySandbox::new();
        let content = "export default function Page() {\n  return <p>héllo</p>;\n}\n";
        CreateOrUpdateFiles
            .call(
                &sandbox,
                json!({"files": [{"path": "app/page.tsx", "content": content}]}),
            )
            .await
            .unwrap();

        let out = ReadFiles
            .call(&sandbox, json!({"files": ["app/page.tsx"]}))
            .await
            .unwrap();
        let entries: Vec<FileEntry> = serde_json::from_str(&out.text).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "app/page.tsx");
        assert_eq!(entries[0].content, content);
    }

    #[tokio::test]
    async fn test_write_reports_files_in_order() {
        let sandbox = MemorySandbox::new();
        let out = CreateOrUpdateFiles
            .call(
                &sandbox,
                json!({"files": [
                    {"path": "b.ts", "content": "B"},
                    {"path": "a.ts", "content": "A"}
                ]}),
            )
            .await
            .unwrap();
        assert_eq!(out.text, "Created or updated 2 file(s): b.ts, a.ts");
        assert_eq!(out.written[0].0, "b.ts");
        assert_eq!(sandbox.file("a.ts").as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_write_stops_at_first_failure() {
        let sandbox = MemorySandbox::new().failing_write("b.ts");
        let err = CreateOrUpdateFiles
            .call(
                &sandbox,
                json!({"files": [
                    {"path": "a.ts", "content": "A"},
                    {"path": "b.ts", "content": "B"},
                    {"path": "c.ts", "content": "C"}
                ]}),
            )
            .await
            .unwrap_err();
        match err {
            ToolFailure::Write { path, written, .. } => {
                assert_eq!(path, "b.ts");
                assert_eq!(written, vec![("a.ts".to_string(), "A".to_string())]);
            }
            other => panic!("Expected Write failure, got {:?}", other),
        }
        assert!(sandbox.file("c.ts").is_none());
    }

    #[tokio::test]
    async fn test_read_missing_file_fails_whole_call() {
        let sandbox = MemorySandbox::new().with_file("a.ts", "A");
        let err = ReadFiles
            .call(&sandbox, json!({"files": ["a.ts", "nope.ts"]}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolFailure::Read { ref path, .. } if path == "nope.ts"));
    }

    #[tokio::test]
    async fn test_list_directory_defaults_to_cwd() {
        let sandbox = MemorySandbox::new().on_command("ls -la '.'", 0, "total 0\n", "");
        let out = ListDirectory.call(&sandbox, json!({})).await.unwrap();
        assert_eq!(out.text, "total 0\n");
        assert_eq!(sandbox.commands(), vec!["ls -la '.'"]);
    }

    #[tokio::test]
    async fn test_list_directory_quotes_path() {
        let sandbox = MemorySandbox::new();
        ListDirectory
            .call(&sandbox, json!({"path": "my dir"}))
            .await
            .unwrap();
        assert_eq!(sandbox.commands(), vec!["ls -la 'my dir'"]);
    }

    #[tokio::test]
    async fn test_list_directory_failure() {
        let sandbox =
            MemorySandbox::new().on_command("ls -la 'nope'", 2, "", "ls: cannot access 'nope'");
        let err = ListDirectory
            .call(&sandbox, json!({"path": "nope"}))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Failed to list directory:"));
    }
}
