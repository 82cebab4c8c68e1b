//! Content sources feeding the archive writer.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, ZimError};

/// Namespace used for regular content.
pub const DEFAULT_NAMESPACE: char = 'A';

/// One item to archive: either content or a redirect to another url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub namespace: char,
    pub url: String,
    pub title: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    /// Url (in the same namespace) this entry redirects to.
    pub redirect: Option<String>,
}

impl Article {
    /// A content article in the default namespace.
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE,
            url: url.into(),
            title: title.into(),
            mime_type: mime_type.into(),
            data: data.into(),
            redirect: None,
        }
    }

    /// A redirect entry in the default namespace.
    pub fn redirect(
        url: impl Into<String>,
        title: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE,
            url: url.into(),
            title: title.into(),
            mime_type: String::new(),
            data: Vec::new(),
            redirect: Some(target.into()),
        }
    }

    pub fn with_namespace(mut self, namespace: char) -> Self {
        self.namespace = namespace;
        self
    }
}

/// Supplier of articles for [`crate::writer::ZimCreator`].
///
/// Articles are pulled one at a time, in order. The hooks with default
/// implementations let a source designate special pages and a fixed uuid.
pub trait ArticleSource {
    /// Next article, `None` once the source is exhausted.
    fn next_article(&mut self) -> Result<Option<Article>>;

    /// `(namespace, url)` of the main page.
    fn main_page(&self) -> Option<(char, String)> {
        None
    }

    /// `(namespace, url)` of the layout page.
    fn layout_page(&self) -> Option<(char, String)> {
        None
    }

    /// Fixed archive uuid. When `None`, one is derived from the content.
    fn uuid(&self) -> Option<[u8; 16]> {
        None
    }
}

/// Adapts any iterator of articles into an [`ArticleSource`].
pub struct IterSource<I> {
    iter: I,
    main_page: Option<(char, String)>,
    layout_page: Option<(char, String)>,
    uuid: Option<[u8; 16]>,
}

impl<I: Iterator<Item = Article>> IterSource<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
            main_page: None,
            layout_page: None,
            uuid: None,
        }
    }

    pub fn with_main_page(mut self, url: impl Into<String>) -> Self {
        self.main_page = Some((DEFAULT_NAMESPACE, url.into()));
        self
    }

    pub fn with_layout_page(mut self, url: impl Into<String>) -> Self {
        self.layout_page = Some((DEFAULT_NAMESPACE, url.into()));
        self
    }

    pub fn with_uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = Some(uuid);
        self
    }
}

impl<I: Iterator<Item = Article>> ArticleSource for IterSource<I> {
    fn next_article(&mut self) -> Result<Option<Article>> {
        Ok(self.iter.next())
    }

    fn main_page(&self) -> Option<(char, String)> {
        self.main_page.clone()
    }

    fn layout_page(&self) -> Option<(char, String)> {
        self.layout_page.clone()
    }

    fn uuid(&self) -> Option<[u8; 16]> {
        self.uuid
    }
}

/// Serves every regular file below a directory as one article.
///
/// Urls are the `/`-joined paths relative to the root, visited in sorted
/// order so repeated runs produce identical archives. Titles are the file
/// stems; mimetypes come from the file extension.
pub struct DirectorySource {
    root: PathBuf,
    files: walkdir::IntoIter,
    main_page: Option<String>,
}

impl DirectorySource {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::metadata(&root).map_err(|e| ZimError::io(&root, e))?;
        let files = WalkDir::new(&root)
            .sort_by_file_name()
            .follow_links(false)
            .into_iter();
        Ok(Self {
            root,
            files,
            main_page: None,
        })
    }

    pub fn with_main_page(mut self, url: impl Into<String>) -> Self {
        self.main_page = Some(url.into());
        self
    }

    fn url_for(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl ArticleSource for DirectorySource {
    fn next_article(&mut self) -> Result<Option<Article>> {
        loop {
            let entry = match self.files.next() {
                None => return Ok(None),
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    return Err(match e.into_io_error() {
                        Some(io) => ZimError::io(path, io),
                        None => ZimError::io(
                            path,
                            std::io::Error::other("filesystem loop detected"),
                        ),
                    });
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let data = std::fs::read(path).map_err(|e| ZimError::io(path, e))?;
            let url = self.url_for(path);
            let title = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| url.clone());
            let mime_type = guess_mime_type(path);
            if mime_type == FALLBACK_MIME_TYPE {
                warn!(path = %path.display(), "Unknown extension, storing as binary");
            }
            debug!(url = %url, size = data.len(), "Read file");
            return Ok(Some(Article::new(url, title, mime_type, data)));
        }
    }

    fn main_page(&self) -> Option<(char, String)> {
        self.main_page
            .as_ref()
            .map(|url| (DEFAULT_NAMESPACE, url.clone()))
    }
}

const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// Mimetype for a file, judged by extension only.
pub fn guess_mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .as_ref()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_mime_type() {
        assert_eq!(guess_mime_type(Path::new("a/index.HTML")), "text/html");
        assert_eq!(guess_mime_type(Path::new("logo.png")), "image/png");
        assert_eq!(guess_mime_type(Path::new("sub/c.txt")), "text/plain");
        assert_eq!(guess_mime_type(Path::new("README")), FALLBACK_MIME_TYPE);
        assert_eq!(guess_mime_type(Path::new("blob.unknownext")), FALLBACK_MIME_TYPE);
    }

    #[test]
    fn test_iter_source_hooks() {
        let mut source = IterSource::new(vec![Article::new("a", "A", "text/plain", "x")])
            .with_main_page("a")
            .with_uuid([7; 16]);
        assert_eq!(source.main_page(), Some(('A', "a".to_string())));
        assert_eq!(source.layout_page(), None);
        assert_eq!(source.uuid(), Some([7; 16]));
        assert!(source.next_article().unwrap().is_some());
        assert!(source.next_article().unwrap().is_none());
    }

    #[test]
    fn test_directory_source_sorted_urls() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.html"), "<p>b</p>").unwrap();
        std::fs::write(dir.path().join("a.css"), "p{}").unwrap();
        std::fs::write(dir.path().join("sub").join("c.txt"), "c").unwrap();

        let mut source = DirectorySource::new(dir.path()).unwrap();
        let mut urls = Vec::new();
        while let Some(article) = source.next_article().unwrap() {
            urls.push((article.url, article.mime_type));
        }
        assert_eq!(
            urls,
            vec![
                ("a.css".to_string(), "text/css".to_string()),
                ("b.html".to_string(), "text/html".to_string()),
                ("sub/c.txt".to_string(), "text/plain".to_string()),
            ]
        );
    }

    #[test]
    fn test_directory_source_missing_root() {
        assert!(matches!(
            DirectorySource::new("/definitely/not/here"),
            Err(ZimError::Io { .. })
        ));
    }
}
