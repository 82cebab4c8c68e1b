//! End-to-end archive construction.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::WriterConfig;
use crate::error::{ConfigError, Result, SourceError, ZimError};
use crate::format::dirent::{DirEntry, Target, REDIRECT_MIMETYPE};
use crate::format::header::{Fileheader, HeaderBuilder, HEADER_SIZE};
use crate::format::{encode_mime_list, CHECKSUM_SIZE};
use crate::writer::assembler::{ClusterAssembler, ClusterTable, MAX_BLOB_SIZE};
use crate::writer::source::{Article, ArticleSource};

/// Article indices must stay below the `NO_PAGE` sentinel.
const MAX_ARTICLES: u64 = u32::MAX as u64 - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Building,
    Finalized,
}

/// One-shot archive builder.
///
/// A creator runs a single build: `Idle -> Building -> Finalized`. Calling
/// [`ZimCreator::create`] a second time fails with
/// [`ConfigError::SessionFinalized`], even if the first build failed.
///
/// ```no_run
/// use zimwriter::writer::{Article, IterSource, ZimCreator};
///
/// let mut creator = ZimCreator::new();
/// creator.set_min_chunk_size(64 * 1024)?;
/// let source = IterSource::new(vec![
///     Article::new("index.html", "Home", "text/html", "<h1>hi</h1>"),
/// ])
/// .with_main_page("index.html");
/// creator.create("out.zim", source)?;
/// println!("{} bytes", creator.current_size()?);
/// # Ok::<(), zimwriter::error::ZimError>(())
/// ```
pub struct ZimCreator {
    config: WriterConfig,
    state: State,
    current_size: u64,
}

impl Default for ZimCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl ZimCreator {
    pub fn new() -> Self {
        Self {
            config: WriterConfig::default(),
            state: State::Idle,
            current_size: 0,
        }
    }

    pub fn with_config(config: WriterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: State::Idle,
            current_size: 0,
        })
    }

    pub fn min_chunk_size(&self) -> usize {
        self.config.min_chunk_size
    }

    /// Set the cluster threshold in bytes. Zero and negative sizes are rejected.
    pub fn set_min_chunk_size(&mut self, size: i64) -> Result<()> {
        if self.state != State::Idle {
            return Err(ConfigError::SessionFinalized.into());
        }
        if size <= 0 {
            return Err(ConfigError::InvalidChunkSize(size).into());
        }
        self.config.min_chunk_size = usize::try_from(size).unwrap_or(usize::MAX);
        Ok(())
    }

    /// Bytes written to the output so far.
    ///
    /// While building this is the header plus every cluster written; once
    /// the build has finished it is the exact archive size.
    pub fn current_size(&self) -> Result<u64> {
        match self.state {
            State::Idle => Err(ConfigError::NotStarted.into()),
            State::Building | State::Finalized => Ok(self.current_size),
        }
    }

    /// Build an archive at `path` from `source`.
    pub fn create(&mut self, path: impl AsRef<Path>, source: impl ArticleSource) -> Result<()> {
        self.create_with_progress(path, source, None)
    }

    /// Like [`ZimCreator::create`], reporting `(items processed, current size)`
    /// after every item.
    pub fn create_with_progress(
        &mut self,
        path: impl AsRef<Path>,
        mut source: impl ArticleSource,
        progress: Option<&dyn Fn(u64, u64)>,
    ) -> Result<()> {
        if self.state != State::Idle {
            return Err(ConfigError::SessionFinalized.into());
        }
        self.state = State::Building;
        self.current_size = HEADER_SIZE as u64;

        let path = path.as_ref();
        let spool_path = spool_path_for(path);
        info!(path = %path.display(), min_chunk_size = self.config.min_chunk_size, "Building archive");

        let result = self.build(path, &spool_path, &mut source, progress);
        self.state = State::Finalized;

        remove_quietly(&spool_path);
        let size = result?;
        self.current_size = size;
        info!(path = %path.display(), size, "Archive written");
        Ok(())
    }

    fn build(
        &mut self,
        path: &Path,
        spool_path: &Path,
        source: &mut impl ArticleSource,
        progress: Option<&dyn Fn(u64, u64)>,
    ) -> Result<u64> {
        // Read back at the end, so open read-write.
        let spool = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(spool_path)
            .map_err(|e| ZimError::io(spool_path, e))?;
        let spool = BufWriter::new(spool);
        let mut assembler = if self.config.background_compression {
            ClusterAssembler::with_background(
                spool,
                self.config.min_chunk_size,
                self.config.compression,
                self.config.queue_depth,
            )
        } else {
            ClusterAssembler::new(spool, self.config.min_chunk_size, self.config.compression)
        };

        let mut catalog = Catalog::default();
        let mut uuid_hasher = Sha256::new();

        while let Some(article) = source.next_article()? {
            let index = catalog.staged.len() as u64;
            if index >= MAX_ARTICLES {
                return Err(SourceError::TooManyArticles { max: MAX_ARTICLES }.into());
            }
            validate(&article, index)?;
            uuid_hasher.update([article.namespace as u8]);
            uuid_hasher.update(article.url.as_bytes());
            uuid_hasher.update([0u8]);
            uuid_hasher.update(&article.data);

            let target = if article.redirect.is_some() {
                None
            } else {
                let mime_index = catalog.mime_index(&article.mime_type)?;
                let locator = assembler
                    .add_blob(&article.data)
                    .map_err(|e| ZimError::io(spool_path, e))?;
                Some((mime_index, locator))
            };

            let Article {
                namespace,
                url,
                title,
                redirect,
                ..
            } = article;
            let (mime_index, target) = match target {
                Some((mime, locator)) => (
                    mime,
                    Target::Blob {
                        cluster: locator.cluster,
                        blob: locator.blob,
                    },
                ),
                // Resolved once every url is known.
                None => (0, Target::Redirect(0)),
            };
            catalog.staged.push(Staged {
                entry: DirEntry {
                    namespace,
                    url,
                    title,
                    mime_index,
                    target,
                },
                redirect,
            });

            assembler
                .maybe_flush()
                .map_err(|e| ZimError::io(spool_path, e))?;
            self.current_size = HEADER_SIZE as u64 + assembler.bytes_written();
            if let Some(cb) = progress {
                cb(index + 1, self.current_size);
            }
        }

        let clusters = assembler
            .finish()
            .map_err(|e| ZimError::io(spool_path, e))?;
        debug!(
            articles = catalog.staged.len(),
            clusters = clusters.offsets.len(),
            bytes = clusters.bytes_written,
            "All items ingested"
        );

        let uuid = source.uuid().unwrap_or_else(|| {
            let digest = uuid_hasher.finalize();
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(&digest[..16]);
            uuid
        });
        let indexed = catalog.index(&*source)?;
        let size = write_archive(path, spool_path, &indexed, clusters, uuid, self.config.checksum)?;
        self.current_size = size;
        Ok(size)
    }
}

struct Staged {
    entry: DirEntry,
    redirect: Option<String>,
}

/// Everything ingested so far, in arrival order.
#[derive(Default)]
struct Catalog {
    mime_types: Vec<String>,
    mime_lookup: HashMap<String, u16>,
    staged: Vec<Staged>,
}

/// Sorted directory, ready to be laid out.
struct IndexedCatalog {
    mime_types: Vec<String>,
    /// Entries in URL order.
    entries: Vec<DirEntry>,
    /// URL-order positions, sorted by title.
    title_order: Vec<u32>,
    main_page: Option<u32>,
    layout_page: Option<u32>,
}

impl Catalog {
    fn mime_index(&mut self, mime: &str) -> Result<u16> {
        if let Some(&index) = self.mime_lookup.get(mime) {
            return Ok(index);
        }
        let index = self.mime_types.len();
        if index >= REDIRECT_MIMETYPE as usize {
            return Err(SourceError::TooManyMimeTypes {
                max: REDIRECT_MIMETYPE as usize,
            }
            .into());
        }
        self.mime_types.push(mime.to_string());
        self.mime_lookup.insert(mime.to_string(), index as u16);
        Ok(index as u16)
    }

    /// Sort by url and by title, resolve redirects and special pages.
    ///
    /// Both sorts are stable, so equal keys keep their arrival order.
    fn index(self, source: &impl ArticleSource) -> Result<IndexedCatalog> {
        let Catalog {
            mime_types, staged, ..
        } = self;

        let mut url_order: Vec<usize> = (0..staged.len()).collect();
        url_order.sort_by(|&a, &b| {
            let (a, b) = (&staged[a].entry, &staged[b].entry);
            (a.namespace, &a.url).cmp(&(b.namespace, &b.url))
        });

        let mut positions: HashMap<(char, &str), u32> = HashMap::with_capacity(staged.len());
        for (pos, &i) in url_order.iter().enumerate() {
            let entry = &staged[i].entry;
            if positions
                .insert((entry.namespace, entry.url.as_str()), pos as u32)
                .is_some()
            {
                return Err(SourceError::DuplicateUrl {
                    namespace: entry.namespace,
                    url: entry.url.clone(),
                }
                .into());
            }
        }

        let mut redirects = Vec::with_capacity(staged.len());
        for &i in &url_order {
            let Staged { entry, redirect } = &staged[i];
            let target = match redirect {
                Some(target) => {
                    let pos = positions
                        .get(&(entry.namespace, target.as_str()))
                        .ok_or_else(|| SourceError::DanglingRedirect {
                            url: entry.url.clone(),
                            target: target.clone(),
                        })?;
                    Some(*pos)
                }
                None => None,
            };
            redirects.push(target);
        }
        if let Some(pos) = find_redirect_loop(&redirects) {
            let entry = &staged[url_order[pos]].entry;
            return Err(SourceError::RedirectLoop {
                url: entry.url.clone(),
            }
            .into());
        }

        let resolve_page = |page: Option<(char, String)>,
                            unknown: fn(String) -> SourceError|
         -> Result<Option<u32>> {
            match page {
                None => Ok(None),
                Some((ns, url)) => match positions.get(&(ns, url.as_str())) {
                    Some(&pos) => Ok(Some(pos)),
                    None => Err(unknown(url).into()),
                },
            }
        };
        let main_page = resolve_page(source.main_page(), SourceError::UnknownMainPage)?;
        let layout_page = resolve_page(source.layout_page(), SourceError::UnknownLayoutPage)?;

        let mut title_order: Vec<u32> = (0..url_order.len() as u32).collect();
        title_order.sort_by(|&a, &b| {
            let (ia, ib) = (url_order[a as usize], url_order[b as usize]);
            let (ea, eb) = (&staged[ia].entry, &staged[ib].entry);
            (ea.namespace, ea.sort_title(), ia).cmp(&(eb.namespace, eb.sort_title(), ib))
        });
        drop(positions);

        let mut slots: Vec<Option<Staged>> = staged.into_iter().map(Some).collect();
        let entries = url_order
            .iter()
            .zip(redirects)
            .filter_map(|(&i, redirect)| {
                slots[i].take().map(|staged| {
                    let mut entry = staged.entry;
                    if let Some(pos) = redirect {
                        entry.target = Target::Redirect(pos);
                    }
                    entry
                })
            })
            .collect();

        Ok(IndexedCatalog {
            mime_types,
            entries,
            title_order,
            main_page,
            layout_page,
        })
    }
}

/// URL position of some redirect whose chain never reaches content.
///
/// `redirects[i]` is the target of entry `i`, `None` for content.
fn find_redirect_loop(redirects: &[Option<u32>]) -> Option<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnPath,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; redirects.len()];
    let mut path = Vec::new();
    for start in 0..redirects.len() {
        let mut current = start;
        while marks[current] == Mark::Unvisited {
            marks[current] = Mark::OnPath;
            path.push(current);
            match redirects[current] {
                Some(next) => current = next as usize,
                None => break,
            }
        }
        if marks[current] == Mark::OnPath && redirects[current].is_some() {
            return Some(current);
        }
        for pos in path.drain(..) {
            marks[pos] = Mark::Done;
        }
    }
    None
}

/// Lay out and write the final archive, returning its size.
fn write_archive(
    path: &Path,
    spool_path: &Path,
    catalog: &IndexedCatalog,
    clusters: ClusterTable<BufWriter<File>>,
    uuid: [u8; 16],
    checksum: bool,
) -> Result<u64> {
    let article_count = catalog.entries.len() as u64;
    let cluster_count = clusters.offsets.len() as u64;

    let mime_list = encode_mime_list(&catalog.mime_types);
    let mime_list_pos = HEADER_SIZE as u64;
    let url_ptr_pos = mime_list_pos + mime_list.len() as u64;
    let title_idx_pos = url_ptr_pos + 8 * article_count;
    let cluster_ptr_pos = title_idx_pos + 4 * article_count;
    let dirent_pos = cluster_ptr_pos + 8 * cluster_count;

    let mut dirents =
        Vec::with_capacity(catalog.entries.iter().map(DirEntry::encoded_len).sum());
    let mut url_ptrs = Vec::with_capacity(catalog.entries.len() * 8);
    for entry in &catalog.entries {
        url_ptrs.extend_from_slice(&(dirent_pos + dirents.len() as u64).to_le_bytes());
        entry.encode(&mut dirents);
    }
    let mut title_idx = Vec::with_capacity(catalog.title_order.len() * 4);
    for pos in &catalog.title_order {
        title_idx.extend_from_slice(&pos.to_le_bytes());
    }
    let cluster_base = dirent_pos + dirents.len() as u64;
    let mut cluster_ptrs = Vec::with_capacity(clusters.offsets.len() * 8);
    for offset in &clusters.offsets {
        cluster_ptrs.extend_from_slice(&(cluster_base + offset).to_le_bytes());
    }
    let body_end = cluster_base + clusters.bytes_written;

    let too_many = || ZimError::from(SourceError::TooManyArticles { max: MAX_ARTICLES });
    let header = HeaderBuilder::new()
        .uuid(uuid)
        .article_count(u32::try_from(article_count).map_err(|_| too_many())?)
        .cluster_count(u32::try_from(cluster_count).map_err(|_| too_many())?)
        .mime_list_pos(mime_list_pos)
        .url_ptr_pos(url_ptr_pos)
        .title_idx_pos(title_idx_pos)
        .cluster_ptr_pos(cluster_ptr_pos)
        .main_page(catalog.main_page)
        .layout_page(catalog.layout_page)
        .checksum_pos(checksum.then_some(body_end))
        .finalize()?;

    let mut spool = clusters
        .writer
        .into_inner()
        .map_err(|e| ZimError::io(spool_path, e.into_error()))?;
    spool
        .seek(SeekFrom::Start(0))
        .map_err(|e| ZimError::io(spool_path, e))?;

    let file = File::create(path).map_err(|e| ZimError::io(path, e))?;
    let regions = [
        ("mime list", mime_list.as_slice()),
        ("url pointers", url_ptrs.as_slice()),
        ("title index", title_idx.as_slice()),
        ("cluster pointers", cluster_ptrs.as_slice()),
        ("directory entries", dirents.as_slice()),
    ];
    let written = emit(file, path, &regions, &mut spool, spool_path, &header);
    if written.is_err() {
        // Without its header the file is not an archive; do not leave it around.
        remove_quietly(path);
    }
    written?;

    Ok(match header.checksum_pos() {
        Some(pos) => pos + CHECKSUM_SIZE as u64,
        None => body_end,
    })
}

/// Write placeholder header, regions, clusters and checksum, then the real header.
fn emit(
    file: File,
    path: &Path,
    regions: &[(&str, &[u8])],
    spool: &mut File,
    spool_path: &Path,
    header: &Fileheader,
) -> Result<()> {
    let io = |e| ZimError::io(path, e);
    let mut out = BufWriter::new(file);
    out.write_all(&[0u8; HEADER_SIZE]).map_err(io)?;

    let mut body = HashingWriter::new(&mut out);
    for (name, region) in regions {
        debug!(region = name, bytes = region.len(), "Writing region");
        body.write_all(region).map_err(io)?;
    }
    let copied = std::io::copy(spool, &mut body).map_err(|e| ZimError::io(spool_path, e))?;
    debug!(region = "clusters", bytes = copied, "Writing region");
    let digest = body.finalize();

    if header.checksum_pos().is_some() {
        out.write_all(&digest).map_err(io)?;
    }
    write_header(&mut out, header).map_err(io)?;
    out.into_inner()
        .map_err(|e| ZimError::io(path, e.into_error()))?
        .sync_all()
        .map_err(io)
}

fn write_header(out: &mut BufWriter<File>, header: &Fileheader) -> std::io::Result<()> {
    out.flush()?;
    out.seek(SeekFrom::Start(0))?;
    out.write_all(&header.serialize())?;
    out.flush()
}

/// Forwards writes while hashing everything that passes through.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finalize(self) -> [u8; CHECKSUM_SIZE] {
        self.hasher.finalize().into()
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn validate(article: &Article, index: u64) -> Result<()> {
    let missing = |field: &'static str| -> Result<()> {
        Err(SourceError::MissingField { index, field }.into())
    };
    if !article.namespace.is_ascii_graphic() {
        return Err(SourceError::InvalidNamespace {
            index,
            namespace: article.namespace,
        }
        .into());
    }
    if article.url.is_empty() {
        return missing("url");
    }
    // Strings are stored NUL-terminated.
    for (field, value) in [
        ("url", &article.url),
        ("title", &article.title),
        ("mimetype", &article.mime_type),
    ] {
        if value.contains('\0') {
            return Err(SourceError::InvalidField { index, field }.into());
        }
    }
    match &article.redirect {
        Some(target) if target.is_empty() => missing("redirect target"),
        Some(_) => Ok(()),
        None if article.mime_type.is_empty() => missing("mimetype"),
        None if article.data.len() > MAX_BLOB_SIZE => Err(SourceError::BlobTooLarge {
            index,
            size: article.data.len(),
        }
        .into()),
        None => Ok(()),
    }
}

/// `<output>.clusters.tmp`, next to the archive.
fn spool_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".clusters.tmp");
    PathBuf::from(name)
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::source::IterSource;

    fn articles() -> Vec<Article> {
        vec![
            Article::new("b", "Beta", "text/html", "bbbb"),
            Article::new("a", "Alpha", "text/plain", "aaaa"),
            Article::new("c", "Alpha", "text/html", "cccc"),
        ]
    }

    #[test]
    fn test_chunk_size_validation() {
        let mut creator = ZimCreator::new();
        assert!(matches!(
            creator.set_min_chunk_size(0),
            Err(ZimError::Config(ConfigError::InvalidChunkSize(0)))
        ));
        assert!(matches!(
            creator.set_min_chunk_size(-5),
            Err(ZimError::Config(ConfigError::InvalidChunkSize(-5)))
        ));
        creator.set_min_chunk_size(4096).unwrap();
        assert_eq!(creator.min_chunk_size(), 4096);
    }

    #[test]
    fn test_current_size_before_build() {
        let creator = ZimCreator::new();
        assert!(matches!(
            creator.current_size(),
            Err(ZimError::Config(ConfigError::NotStarted))
        ));
    }

    #[test]
    fn test_catalog_ordering() {
        let mut catalog = Catalog::default();
        for (i, article) in articles().into_iter().enumerate() {
            let mime_index = catalog.mime_index(&article.mime_type).unwrap();
            catalog.staged.push(Staged {
                entry: DirEntry {
                    namespace: article.namespace,
                    url: article.url,
                    title: article.title,
                    mime_index,
                    target: Target::Blob {
                        cluster: 0,
                        blob: i as u32,
                    },
                },
                redirect: None,
            });
        }
        assert_eq!(catalog.mime_types, vec!["text/html", "text/plain"]);

        let source = IterSource::new(Vec::<Article>::new()).with_main_page("c");
        let indexed = catalog.index(&source).unwrap();
        let urls: Vec<&str> = indexed.entries.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["a", "b", "c"]);
        // "Alpha" ties between a (arrived second) and c (arrived third).
        assert_eq!(indexed.title_order, vec![0, 2, 1]);
        assert_eq!(indexed.main_page, Some(2));
        assert_eq!(indexed.layout_page, None);
    }

    #[test]
    fn test_missing_fields() {
        let no_url = Article::new("", "t", "text/html", "x");
        assert!(matches!(
            validate(&no_url, 3),
            Err(ZimError::Source(SourceError::MissingField { index: 3, field: "url" }))
        ));
        let no_mime = Article::new("u", "t", "", "x");
        assert!(matches!(
            validate(&no_mime, 0),
            Err(ZimError::Source(SourceError::MissingField { field: "mimetype", .. }))
        ));
        let redirect = Article::redirect("u", "t", "");
        assert!(matches!(
            validate(&redirect, 0),
            Err(ZimError::Source(SourceError::MissingField { field: "redirect target", .. }))
        ));
        let bad_ns = Article::new("u", "t", "text/html", "x").with_namespace('é');
        assert!(matches!(
            validate(&bad_ns, 0),
            Err(ZimError::Source(SourceError::InvalidNamespace { .. }))
        ));
    }

    #[test]
    fn test_spool_path() {
        assert_eq!(
            spool_path_for(Path::new("/tmp/out.zim")),
            PathBuf::from("/tmp/out.zim.clusters.tmp")
        );
    }

    #[test]
    fn test_nul_bytes_rejected() {
        let cases = [
            (Article::new("a\0b", "t", "text/html", "x"), "url"),
            (Article::new("a", "t\0", "text/html", "x"), "title"),
            (Article::new("a", "t", "text/html\0x", "x"), "mimetype"),
        ];
        for (article, expected) in cases {
            assert!(matches!(
                validate(&article, 4),
                Err(ZimError::Source(SourceError::InvalidField { index: 4, field })) if field == expected
            ));
        }
        // Payloads are binary and may hold anything.
        assert!(validate(&Article::new("a", "t", "text/html", vec![0u8; 8]), 0).is_ok());
    }

    #[test]
    fn test_find_redirect_loop() {
        assert_eq!(find_redirect_loop(&[]), None);
        // 0 -> 1 -> 2 (content), 3 -> 0
        assert_eq!(find_redirect_loop(&[Some(1), Some(2), None, Some(0)]), None);
        assert_eq!(find_redirect_loop(&[Some(0)]), Some(0));
        // 2 -> 3 -> 1 -> 2, entered from 0
        let found = find_redirect_loop(&[Some(2), Some(2), Some(3), Some(1), None]);
        assert!(matches!(found, Some(1..=3)));
    }
}
