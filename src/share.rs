use std::{
    fs::{self, File},
    io::{self, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use tachyon_reactor::library::http::{
    range::{parse_range, unsatisfied_range},
    request::{HttpRequest, Method},
    response::{HttpResponse, StatusCode},
    server::HttpService,
};
use tracing::{info, warn};

const BANNER: &str = "tachyon-reactor file share\n\
GET  /files                 list stored files\n\
GET  /download?name=<file>  fetch a file (Range supported)\n\
POST /upload?name=<file>    store the request body\n";

/// A flat directory served over HTTP.
pub struct FileShare {
    root: PathBuf,
}

/// No separators, no parent hops: the name must stay inside the root.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

fn bad_name() -> HttpResponse {
    HttpResponse::text(StatusCode::BadRequest, "missing or invalid file name\n")
}

impl FileShare {
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: fs::canonicalize(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target(&self, request: &HttpRequest) -> Option<PathBuf> {
        request
            .param("name")
            .filter(|name| is_plain_name(name))
            .map(|name| self.root.join(name))
    }

    fn list(&self) -> HttpResponse {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Cannot list {}: {err}", self.root.display());
                return HttpResponse::text(StatusCode::InternalServerError, "listing failed\n");
            }
        };
        let mut files: Vec<(String, u64)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                meta.is_file()
                    .then(|| (entry.file_name().to_string_lossy().into_owned(), meta.len()))
            })
            .collect();
        files.sort();
        let body: String = files
            .iter()
            .map(|(name, size)| format!("{name}\t{size}\n"))
            .collect();
        HttpResponse::text(StatusCode::Ok, body)
    }

    fn download(&self, request: &HttpRequest) -> HttpResponse {
        let Some(path) = self.target(request) else {
            return bad_name();
        };
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return HttpResponse::text(StatusCode::NotFound, "no such file\n");
            }
            Err(err) => {
                warn!("Cannot open {}: {err}", path.display());
                return HttpResponse::text(StatusCode::InternalServerError, "open failed\n");
            }
        };
        let total = match file.metadata() {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return HttpResponse::text(StatusCode::NotFound, "no such file\n"),
        };

        let range = match request.header("Range").map(|value| parse_range(value, total)) {
            Some(Err(_)) => {
                let mut response =
                    HttpResponse::text(StatusCode::RangeNotSatisfiable, "range not satisfiable\n");
                response.set_header("Content-Range", unsatisfied_range(total));
                return response;
            }
            Some(Ok(range)) => range,
            None => None,
        };

        let mut response = HttpResponse::new(StatusCode::Ok);
        response
            .set_header("Content-Type", "application/octet-stream")
            .set_header("Accept-Ranges", "bytes");
        if let Some(name) = path.file_name() {
            response.set_header(
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", name.to_string_lossy()),
            );
        }
        match range {
            Some(range) => {
                if let Err(err) = file.seek(SeekFrom::Start(range.start)) {
                    warn!("Cannot seek {}: {err}", path.display());
                    return HttpResponse::text(StatusCode::InternalServerError, "seek failed\n");
                }
                response
                    .set_status(StatusCode::PartialContent)
                    .set_header("Content-Range", range.content_range(total))
                    .set_stream(Box::new(io::Read::take(file, range.len())));
            }
            None => {
                response.set_stream(Box::new(file));
            }
        }
        response
    }

    /// Body arrived in one piece, small enough to have been kept in memory.
    fn store(&self, request: &HttpRequest) -> HttpResponse {
        let Some(path) = self.target(request) else {
            return bad_name();
        };
        match fs::write(&path, &request.body) {
            Ok(()) => {
                info!("Stored {} ({} bytes)", path.display(), request.body.len());
                HttpResponse::text(StatusCode::Created, format!("stored {} bytes\n", request.body.len()))
            }
            Err(err) => {
                warn!("Cannot write {}: {err}", path.display());
                HttpResponse::text(StatusCode::InternalServerError, "write failed\n")
            }
        }
    }
}

impl HttpService for FileShare {
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        match (request.method, request.url.as_str()) {
            (Method::Get, "/") => HttpResponse::text(StatusCode::Ok, BANNER),
            (Method::Get, "/files") => self.list(),
            (Method::Get, "/download") => self.download(request),
            (Method::Post, "/upload") => self.store(request),
            (_, "/" | "/files" | "/download" | "/upload") => {
                HttpResponse::text(StatusCode::MethodNotAllowed, "method not allowed\n")
            }
            _ => HttpResponse::text(StatusCode::NotFound, "not found\n"),
        }
    }

    fn open_upload(&self, request: &HttpRequest) -> Option<Box<dyn Write + Send>> {
        if request.method != Method::Post || request.url != "/upload" {
            return None;
        }
        // An invalid name falls through to `handle`, which answers 400
        let path = self.target(request)?;
        match File::create(&path) {
            Ok(file) => Some(Box::new(BufWriter::new(file))),
            Err(err) => {
                warn!("Cannot create {}: {err}", path.display());
                None
            }
        }
    }

    fn finish_upload(&self, request: &HttpRequest, received: u64) -> HttpResponse {
        info!(
            "Stored {} ({received} bytes, streamed)",
            request.param("name").unwrap_or_default()
        );
        HttpResponse::text(StatusCode::Created, format!("stored {received} bytes\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Read;

    fn share(tag: &str) -> FileShare {
        let dir = std::env::temp_dir().join(format!("share-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        FileShare::open(&dir).unwrap()
    }

    fn get(url: &str, params: &[(&str, &str)], headers: &[(&str, &str)]) -> HttpRequest {
        HttpRequest {
            method: Method::Get,
            url: url.into(),
            params: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..Default::default()
        }
    }

    fn body_of(response: HttpResponse) -> (String, Vec<u8>) {
        let (head, stream) = response.encode();
        let head = String::from_utf8_lossy(&head).into_owned();
        let mut body = Vec::new();
        if let Some(mut reader) = stream {
            reader.read_to_end(&mut body).unwrap();
        }
        (head, body)
    }

    #[test]
    fn names_must_stay_inside_the_root() {
        assert!(is_plain_name("report.pdf"));
        for bad in ["", "../etc/passwd", "a/b", "a\\b", "..", "x..y"] {
            assert!(!is_plain_name(bad), "{bad}");
        }
        let share = share("names");
        let response = share.handle(&get("/download", &[("name", "../secret")], &[]));
        assert_eq!(response.status(), StatusCode::BadRequest);
        fs::remove_dir_all(share.root()).unwrap();
    }

    #[test]
    fn store_list_and_fetch() {
        let share = share("roundtrip");
        let mut upload = get("/upload", &[("name", "hello.txt")], &[]);
        upload.method = Method::Post;
        upload.body = Bytes::from_static(b"0123456789");
        assert_eq!(share.handle(&upload).status(), StatusCode::Created);

        // Listing bodies are in memory, so they ride along with the head
        let (listing, _) = body_of(share.handle(&get("/files", &[], &[])));
        assert!(listing.ends_with("\r\n\r\nhello.txt\t10\n"));

        let (head, body) = body_of(share.handle(&get("/download", &[("name", "hello.txt")], &[])));
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(body, b"0123456789");

        let (head, body) = body_of(share.handle(&get(
            "/download",
            &[("name", "hello.txt")],
            &[("Range", "bytes=2-5")],
        )));
        assert!(head.starts_with("HTTP/1.1 206 Partial Content"));
        assert!(head.contains("Content-Range: bytes 2-5/10\r\n"));
        assert_eq!(body, b"2345");

        let response = share.handle(&get("/download", &[("name", "hello.txt")], &[("Range", "bytes=10-")]));
        assert_eq!(response.status(), StatusCode::RangeNotSatisfiable);
        fs::remove_dir_all(share.root()).unwrap();
    }

    #[test]
    fn unknown_routes() {
        let share = share("routes");
        assert_eq!(share.handle(&get("/nope", &[], &[])).status(), StatusCode::NotFound);
        let mut delete = get("/files", &[], &[]);
        delete.method = Method::Delete;
        assert_eq!(share.handle(&delete).status(), StatusCode::MethodNotAllowed);
        fs::remove_dir_all(share.root()).unwrap();
    }
}
