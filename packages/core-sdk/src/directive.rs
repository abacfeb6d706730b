use std::path::Path;

use crate::{error::ChatError, telemetry};

/**
 * \brief 读取系统指令文件，每次请求重新读取，不做进程内缓存。
 * \details 文件缺失或不可读时记录日志并返回空串，请求继续进行。
 */
pub async fn load_directive(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) => {
            let unavailable = ChatError::ResourceUnavailable {
                path: path.display().to_string(),
                reason: err.to_string(),
            };
            telemetry::log_error("relay.directive", &unavailable.to_string());
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_yields_empty_directive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let text = load_directive(&dir.path().join("faqs.md")).await;
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn test_reads_file_fresh_each_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("faqs.md");
        std::fs::write(&path, "Q: Opening hours?\nA: 6am-10pm").expect("write");
        assert_eq!(load_directive(&path).await, "Q: Opening hours?\nA: 6am-10pm");

        std::fs::write(&path, "updated").expect("rewrite");
        assert_eq!(load_directive(&path).await, "updated");
    }
}
