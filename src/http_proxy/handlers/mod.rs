pub mod allow;
pub mod deny;
pub mod huggingface_dataset;
pub mod huggingface_model;

pub use allow::Allow;
pub use deny::Deny;
pub use huggingface_dataset::HuggingfaceDataset;
pub use huggingface_model::HuggingfaceModel;

/// Resolves a request path the way `url.Parse(p).Path` + `ResolveReference`
/// does in `examples/original_source/pkg/jnproxy/handler/http/utils.go`:
/// strips any query/fragment and normalizes `.`/`..` segments against an
/// empty base, leaving an absolute path.
pub fn abs_url_path(path: &str) -> String {
    let without_query = path.split(['?', '#']).next().unwrap_or("");
    let mut segments: Vec<&str> = Vec::new();
    for seg in without_query.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_plain_path() {
        assert_eq!(abs_url_path("/a/b/c"), "/a/b/c");
    }

    #[test]
    fn strips_query_string() {
        assert_eq!(abs_url_path("/a/b?x=1&y=2"), "/a/b");
    }

    #[test]
    fn collapses_dot_segments() {
        assert_eq!(abs_url_path("/a/./b/../c"), "/a/c");
    }
}
