use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::PpmiSettings;
use crate::domain::{StudyFileIdentifier, SubjectId};
use crate::error::LivingParkError;
use crate::fs_util;

static DATE_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_\d+[a-zA-Z]+\d+").unwrap());

#[derive(Debug, Clone, Copy)]
pub struct DownloadInfo {
    pub is_zip: bool,
}

pub trait PpmiClient: Send + Sync {
    /// Download one study file into `destination_dir`, returning the written
    /// path. The server may name the file with a download date suffix.
    fn download_study_file(
        &self,
        name: &str,
        destination_dir: &Path,
        timeout: Duration,
    ) -> Result<PathBuf, LivingParkError>;

    /// Fetch the T1 images of `subjects` as a single archive.
    fn download_imaging(
        &self,
        subjects: &[SubjectId],
        destination: &Path,
        timeout: Duration,
    ) -> Result<DownloadInfo, LivingParkError>;
}

#[derive(Clone)]
pub struct PpmiHttpClient {
    client: Client,
    base_url: String,
}

impl PpmiHttpClient {
    pub fn new(settings: &PpmiSettings) -> Result<Self, LivingParkError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("livingpark/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| LivingParkError::PpmiHttp(err.to_string()))?,
        );
        if let Some(token) = &settings.api_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| LivingParkError::PpmiHttp(err.to_string()))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| LivingParkError::PpmiHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
        })
    }

    pub fn study_file_url(&self, name: &str) -> String {
        format!("{}/study-files/{name}", self.base_url)
    }

    pub fn imaging_url(&self) -> String {
        format!("{}/imaging", self.base_url)
    }

    fn send(request: RequestBuilder) -> Result<Response, LivingParkError> {
        let response = request.send().map_err(map_request_error)?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "PPMI request failed".to_string());
        Err(LivingParkError::PpmiStatus { status, message })
    }

    fn write_response_to_file(
        mut response: Response,
        destination: &Path,
    ) -> Result<DownloadInfo, LivingParkError> {
        let is_zip = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.contains("zip"))
            .unwrap_or(false);

        let mut file =
            File::create(destination).map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        io::copy(&mut response, &mut file).map_err(|err| {
            if err.kind() == io::ErrorKind::TimedOut {
                LivingParkError::PpmiTimeout(err.to_string())
            } else {
                LivingParkError::Filesystem(err.to_string())
            }
        })?;
        Ok(DownloadInfo { is_zip })
    }
}

impl PpmiClient for PpmiHttpClient {
    fn download_study_file(
        &self,
        name: &str,
        destination_dir: &Path,
        timeout: Duration,
    ) -> Result<PathBuf, LivingParkError> {
        let url = self.study_file_url(name);
        let response = Self::send(self.client.get(&url).timeout(timeout))?;
        let file_name = attachment_file_name(&response).unwrap_or_else(|| name.to_string());
        let destination = destination_dir.join(file_name);
        Self::write_response_to_file(response, &destination)?;
        Ok(destination)
    }

    fn download_imaging(
        &self,
        subjects: &[SubjectId],
        destination: &Path,
        timeout: Duration,
    ) -> Result<DownloadInfo, LivingParkError> {
        let subjects = subjects
            .iter()
            .map(SubjectId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let request = self
            .client
            .get(self.imaging_url())
            .query(&[("subjects", subjects.as_str()), ("format", "nifti")])
            .timeout(timeout);
        let response = Self::send(request)?;
        Self::write_response_to_file(response, destination)
    }
}

/// File name from a `Content-Disposition: attachment; filename=...` header,
/// reduced to its last path component.
fn attachment_file_name(response: &Response) -> Option<String> {
    let header = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    let value = header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))?
        .trim_matches('"');
    Path::new(value)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

fn map_request_error(err: reqwest::Error) -> LivingParkError {
    if err.is_timeout() {
        LivingParkError::PpmiTimeout(err.to_string())
    } else {
        LivingParkError::PpmiHttp(err.to_string())
    }
}

/// PPMI appends the download date to study files, e.g.
/// `MDS-UPDRS_Part_III_18Oct2023.csv`; this restores the canonical name.
pub fn strip_download_date_suffix(name: &str) -> String {
    DATE_SUFFIX.replace_all(name, "").into_owned()
}

/// Split `items` into consecutive batches of at most `size` elements.
pub fn batched<T>(items: &[T], size: usize) -> impl Iterator<Item = &[T]> {
    items.chunks(size.max(1))
}

/// Fields of the XML sidecar shipped with every PPMI image collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageMetadata {
    pub subject_id: Option<String>,
    pub visit_id: Option<String>,
    pub series_id: Option<String>,
    pub image_id: Option<String>,
    pub description: Option<String>,
    pub n_files: Option<u32>,
}

pub fn parse_image_metadata(xml: &str) -> Result<ImageMetadata, LivingParkError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut meta = ImageMetadata::default();
    // (element name, is the `Matrix Z` protocol entry)
    let mut stack: Vec<(Vec<u8>, bool)> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|err| LivingParkError::Metadata(err.to_string()))?;
        match event {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                let matrix_z = name.as_slice() == b"protocol" && has_attribute(&e, b"term", "Matrix Z")?;
                stack.push((name, matrix_z));
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(text) => {
                let value = text
                    .unescape()
                    .map_err(|err| LivingParkError::Metadata(err.to_string()))?
                    .trim()
                    .to_string();
                let Some((name, matrix_z)) = stack.last() else {
                    continue;
                };
                if value.is_empty() {
                    continue;
                }
                let in_protocol = stack
                    .iter()
                    .any(|(ancestor, _)| ancestor.as_slice() == b"imagingProtocol");
                let slot = match name.as_slice() {
                    b"subjectIdentifier" => &mut meta.subject_id,
                    b"visitIdentifier" => &mut meta.visit_id,
                    b"seriesIdentifier" => &mut meta.series_id,
                    b"imageUID" => &mut meta.image_id,
                    b"description" if in_protocol => &mut meta.description,
                    b"protocol" if *matrix_z && in_protocol => {
                        if meta.n_files.is_none() {
                            meta.n_files = value.parse::<f64>().ok().map(|count| count as u32);
                        }
                        continue;
                    }
                    _ => continue,
                };
                if slot.is_none() {
                    *slot = Some(value);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(meta)
}

fn has_attribute(element: &BytesStart<'_>, key: &[u8], expected: &str) -> Result<bool, LivingParkError> {
    for attribute in element.attributes() {
        let attribute = attribute.map_err(|err| LivingParkError::Metadata(err.to_string()))?;
        if attribute.key.local_name().as_ref() == key {
            let value = attribute
                .unescape_value()
                .map_err(|err| LivingParkError::Metadata(err.to_string()))?;
            return Ok(value == expected);
        }
    }
    Ok(false)
}

/// XML sidecars under `search_root` that describe the image of `id`: same
/// subject, visit name and protocol description.
pub fn find_image_metadata(
    search_root: &Path,
    id: &StudyFileIdentifier,
) -> Result<Vec<ImageMetadata>, LivingParkError> {
    let visit_name = id.visit.visit_name().ok_or_else(|| {
        LivingParkError::FileMatching(format!("unknown PPMI visit code: {}", id.visit))
    })?;
    let xml_prefix = format!("PPMI_{}_{}_", id.subject, id.description.cleaned());

    let mut found = Vec::new();
    for xml_file in fs_util::find_files_with_suffix(search_root, ".xml")? {
        let is_candidate = xml_file
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(&xml_prefix))
            .unwrap_or(false);
        if !is_candidate {
            continue;
        }

        let content = std::fs::read_to_string(&xml_file)
            .map_err(|err| LivingParkError::Filesystem(err.to_string()))?;
        let meta = parse_image_metadata(&content)?;
        let matches = meta.subject_id.as_deref() == Some(id.subject.as_str())
            && meta.visit_id.as_deref() == Some(visit_name)
            && meta.description.as_deref() == Some(id.description.as_str());
        if matches && meta.series_id.is_some() && meta.image_id.is_some() {
            found.push(meta);
        }
    }
    Ok(found)
}

/// Locate the raw DICOM series of `id` in a downloaded PPMI collection.
///
/// Candidate series are found through their XML sidecars, which must agree on
/// subject, visit name and description. The DICOM file count is checked against
/// the `Matrix Z` value of the protocol.
pub fn find_dicom(search_root: &Path, id: &StudyFileIdentifier) -> Result<Vec<PathBuf>, LivingParkError> {
    let cleaned = id.description.cleaned();

    for meta in find_image_metadata(search_root, id)? {
        let (Some(series), Some(image)) = (meta.series_id.as_deref(), meta.image_id.as_deref())
        else {
            continue;
        };
        let pattern = format!(
            r"^PPMI_{}_MR_{}_*br_raw.*_S{}_I{}\.dcm$",
            regex::escape(id.subject.as_str()),
            regex::escape(&cleaned),
            regex::escape(series),
            regex::escape(image),
        );
        let regex = Regex::new(&pattern).map_err(|err| LivingParkError::FileMatching(err.to_string()))?;
        let subject_dir = search_root.join("PPMI").join(id.subject.as_str());
        let dicom_root = if subject_dir.is_dir() { subject_dir } else { search_root.to_path_buf() };

        let files = fs_util::find_files_with_suffix(&dicom_root, ".dcm")?
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| regex.is_match(name))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();

        if files.is_empty() {
            return Err(LivingParkError::FileMatching(format!(
                "found no files matching {}/**/{pattern}",
                dicom_root.display()
            )));
        }
        match meta.n_files {
            Some(expected) if expected as usize == files.len() => {
                info!(identifier = %id, count = files.len(), "found all DICOM files");
            }
            expected => {
                warn!(
                    identifier = %id,
                    found = files.len(),
                    expected = ?expected,
                    "DICOM file count differs from the image metadata"
                );
            }
        }
        return Ok(files);
    }

    Err(LivingParkError::FileMatching(format!(
        "no XML metadata found for subject={} visit={} description={:?}",
        id.subject, id.visit, id.description.as_str()
    )))
}
