use std::io::{Read, Write};
use std::time::Duration;

use chrono::Utc;
use rusty_s3::actions::{CreateMultipartUpload, ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use floe_types::error::{FloeError, Result};

use crate::http_util::{clean_etag, extract_content_length, parse_restore_header, parse_timestamp};
use crate::retry::{body_error, http_error, retry_http};
use crate::sigv4;
use crate::{
    ObjectHead, ObjectInfo, ObjectStore, RestoreRequest, RestoreTier, RetryConfig, StorageClass,
};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// Objects above this size go through multipart upload (single PUT caps at 5 GiB).
const MULTIPART_THRESHOLD: u64 = 512 * 1024 * 1024;

/// Smallest part we send. Grown for very large objects to stay under 10 000 parts.
const MIN_PART_SIZE: u64 = 64 * 1024 * 1024;

const MAX_PARTS: u64 = 9_000;

pub struct S3Store {
    bucket: Bucket,
    bucket_name: String,
    credentials: Credentials,
    endpoint: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    agent: ureq::Agent,
    retry: RetryConfig,
    /// Prefix (root path) prepended to all keys.
    root: String,
}

impl S3Store {
    pub fn new(
        bucket_name: &str,
        region: &str,
        root: &str,
        endpoint: &str,
        access_key_id: &str,
        secret_access_key: &str,
        retry: RetryConfig,
    ) -> Result<Self> {
        let base_url = endpoint
            .parse()
            .map_err(|e| FloeError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}")))?;

        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            bucket_name.to_string(),
            region.to_string(),
        )
        .map_err(|e| FloeError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let credentials = Credentials::new(access_key_id, secret_access_key);

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            bucket,
            bucket_name: bucket_name.to_string(),
            credentials,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            region: region.to_string(),
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            agent,
            retry,
            root: root.trim_matches('/').to_string(),
        })
    }

    /// Prepend the root prefix to a key.
    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        if self.root.is_empty() {
            key
        } else {
            key.strip_prefix(&self.root)
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(key)
        }
    }

    fn put_single(
        &self,
        key: &str,
        reader: &mut dyn Read,
        len: u64,
        class: &StorageClass,
    ) -> Result<String> {
        let op = format!("S3 PUT {key}");
        let full_key = self.full_key(key);
        let mut action = self.bucket.put_object(Some(&self.credentials), &full_key);
        action
            .headers_mut()
            .insert("x-amz-storage-class", class.as_str());
        let url = action.sign(PRESIGN_DURATION);

        let resp = self
            .agent
            .put(url.as_str())
            .set("x-amz-storage-class", class.as_str())
            .set("Content-Length", &len.to_string())
            .send((&mut *reader).take(len))
            .map_err(|e| http_error(&op, e))?;
        Ok(resp.header("ETag").map(clean_etag).unwrap_or_default())
    }

    fn put_multipart(
        &self,
        key: &str,
        reader: &mut dyn Read,
        len: u64,
        class: &StorageClass,
    ) -> Result<String> {
        let op = format!("S3 MULTIPART {key}");
        let full_key = self.full_key(key);

        let mut create = self
            .bucket
            .create_multipart_upload(Some(&self.credentials), &full_key);
        create
            .headers_mut()
            .insert("x-amz-storage-class", class.as_str());
        let url = create.sign(PRESIGN_DURATION);
        let body = self
            .agent
            .post(url.as_str())
            .set("x-amz-storage-class", class.as_str())
            .call()
            .map_err(|e| http_error(&op, e))?
            .into_string()
            .map_err(|e| body_error(&op, e))?;
        let created = CreateMultipartUpload::parse_response(&body)
            .map_err(|e| FloeError::transport(&op, format!("bad create response: {e}"), false))?;
        let upload_id = created.upload_id().to_string();

        match self.upload_parts(key, &full_key, &upload_id, reader, len) {
            Ok(etags) => {
                let complete = self.bucket.complete_multipart_upload(
                    Some(&self.credentials),
                    &full_key,
                    &upload_id,
                    etags.iter().map(String::as_str),
                );
                let url = complete.sign(PRESIGN_DURATION);
                let body = complete.body();
                let resp = retry_http(&self.retry, &format!("COMPLETE {key}"), || {
                    self.agent.post(url.as_str()).send_string(&body)
                })
                .map_err(|e| http_error(&op, e))?;
                let text = resp.into_string().map_err(|e| body_error(&op, e))?;
                let etag = text
                    .split("<ETag>")
                    .nth(1)
                    .and_then(|s| s.split("</ETag>").next())
                    .map(|s| clean_etag(&s.replace("&quot;", "\"")))
                    .unwrap_or_default();
                Ok(etag)
            }
            Err(e) => {
                let abort = self.bucket.abort_multipart_upload(
                    Some(&self.credentials),
                    &full_key,
                    &upload_id,
                );
                let url = abort.sign(PRESIGN_DURATION);
                if let Err(abort_err) = self.agent.delete(url.as_str()).call() {
                    tracing::warn!("S3 ABORT {key}: {abort_err}");
                }
                Err(e)
            }
        }
    }

    fn upload_parts(
        &self,
        key: &str,
        full_key: &str,
        upload_id: &str,
        reader: &mut dyn Read,
        len: u64,
    ) -> Result<Vec<String>> {
        let part_size = MIN_PART_SIZE.max(len.div_ceil(MAX_PARTS));
        let mut etags = Vec::new();
        let mut remaining = len;
        let mut part_number: u16 = 1;

        while remaining > 0 {
            let this_part = remaining.min(part_size);
            let mut buf = Vec::with_capacity(this_part as usize);
            (&mut *reader).take(this_part).read_to_end(&mut buf)?;
            if buf.len() as u64 != this_part {
                return Err(FloeError::Other(format!(
                    "S3 UPLOAD_PART {key}: source ended early ({} of {this_part} bytes)",
                    buf.len()
                )));
            }
            let url = self
                .bucket
                .upload_part(Some(&self.credentials), full_key, part_number, upload_id)
                .sign(PRESIGN_DURATION);
            let op = format!("UPLOAD_PART {key} #{part_number}");
            let resp = retry_http(&self.retry, &op, || {
                self.agent.put(url.as_str()).send_bytes(&buf)
            })
            .map_err(|e| {
                // Part-level retries are exhausted; restarting the whole upload
                // would resend everything already accepted.
                let mut err = http_error(&op, e);
                if let FloeError::Transport { transient, .. } = &mut err {
                    *transient = false;
                }
                err
            })?;
            let etag = resp.header("ETag").unwrap_or_default().to_string();
            etags.push(etag);
            remaining -= this_part;
            part_number += 1;
        }
        Ok(etags)
    }
}

impl ObjectStore for S3Store {
    fn put_bytes(&self, key: &str, data: &[u8], class: &StorageClass) -> Result<String> {
        let mut cursor = std::io::Cursor::new(data);
        self.put_single(key, &mut cursor, data.len() as u64, class)
    }

    fn put_reader(
        &self,
        key: &str,
        reader: &mut dyn Read,
        len: u64,
        class: &StorageClass,
    ) -> Result<String> {
        if len > MULTIPART_THRESHOLD {
            self.put_multipart(key, reader, len, class)
        } else {
            self.put_single(key, reader, len, class)
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let op = format!("S3 GET {key}");
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);
        match self.agent.get(url.as_str()).call() {
            Ok(resp) => {
                let mut buf = Vec::new();
                resp.into_reader()
                    .read_to_end(&mut buf)
                    .map_err(|e| body_error(&op, e))?;
                Ok(Some(buf))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(http_error(&op, e)),
        }
    }

    fn get_to_writer(&self, key: &str, writer: &mut dyn Write) -> Result<u64> {
        let op = format!("S3 GET {key}");
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);
        match self.agent.get(url.as_str()).call() {
            Ok(resp) => {
                let expected = extract_content_length(&resp, &op).ok();
                let copied = std::io::copy(&mut resp.into_reader(), writer)
                    .map_err(|e| body_error(&op, e))?;
                if let Some(expected) = expected {
                    if copied != expected {
                        return Err(FloeError::transport(
                            &op,
                            format!("short read: expected {expected} bytes, got {copied}"),
                            true,
                        ));
                    }
                }
                Ok(copied)
            }
            Err(ureq::Error::Status(404, _)) => Err(FloeError::NotFound(key.to_string())),
            Err(e) => Err(http_error(&op, e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let op = format!("S3 LIST {prefix}");
        let full_prefix = self.full_key(prefix);
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", &full_prefix);
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let resp = self
                .agent
                .get(url.as_str())
                .call()
                .map_err(|e| http_error(&op, e))?;
            let mut body = Vec::new();
            resp.into_reader()
                .read_to_end(&mut body)
                .map_err(|e| body_error(&op, e))?;
            let parsed = ListObjectsV2::parse_response(&body).map_err(|e| {
                FloeError::transport(&op, format!("failed to parse response: {e}"), false)
            })?;

            for obj in parsed.contents {
                if obj.key.ends_with('/') {
                    continue;
                }
                objects.push(ObjectInfo {
                    key: self.relative_key(&obj.key).to_string(),
                    size: obj.size,
                    etag: clean_etag(&obj.etag),
                    last_modified: parse_timestamp(&obj.last_modified).unwrap_or_else(Utc::now),
                    storage_class: StorageClass::from(
                        obj.storage_class.as_deref().unwrap_or("STANDARD"),
                    ),
                });
            }

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(objects)
    }

    fn head(&self, key: &str) -> Result<Option<ObjectHead>> {
        let op = format!("S3 HEAD {key}");
        let url = self
            .bucket
            .head_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);

        match self.agent.head(url.as_str()).call() {
            Ok(resp) => {
                let size = extract_content_length(&resp, &op)?;
                let info = ObjectInfo {
                    key: key.to_string(),
                    size,
                    etag: resp.header("ETag").map(clean_etag).unwrap_or_default(),
                    last_modified: resp
                        .header("Last-Modified")
                        .and_then(parse_timestamp)
                        .unwrap_or_else(Utc::now),
                    storage_class: StorageClass::from(
                        resp.header("x-amz-storage-class").unwrap_or("STANDARD"),
                    ),
                };
                let restore = parse_restore_header(resp.header("x-amz-restore"));
                Ok(Some(ObjectHead { info, restore }))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(http_error(&op, e)),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);
        match self.agent.delete(url.as_str()).call() {
            Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(http_error(&format!("S3 DELETE {key}"), e)),
        }
    }

    fn request_restore(&self, key: &str, days: u32, tier: RestoreTier) -> Result<RestoreRequest> {
        let op = format!("S3 RESTORE {key}");
        let body = format!(
            "<RestoreRequest><Days>{days}</Days><GlacierJobParameters><Tier>{}</Tier></GlacierJobParameters></RestoreRequest>",
            tier.as_str()
        );
        let path = format!("/{}/{}", self.bucket_name, self.full_key(key));
        let creds = sigv4::Credentials {
            access_key_id: &self.access_key_id,
            secret_access_key: &self.secret_access_key,
            region: &self.region,
        };
        let signed = sigv4::sign(
            "POST",
            &self.endpoint,
            &path,
            "restore",
            body.as_bytes(),
            &creds,
            Utc::now(),
        )?;

        let mut req = self.agent.post(&signed.url);
        for (name, value) in &signed.headers {
            req = req.set(name, value);
        }
        match req.send_string(&body) {
            Ok(resp) if resp.status() == 200 => Ok(RestoreRequest::AlreadyAvailable),
            Ok(_) => Ok(RestoreRequest::Accepted),
            Err(ureq::Error::Status(409, _)) => Ok(RestoreRequest::AlreadyInProgress),
            Err(ureq::Error::Status(404, _)) => Err(FloeError::NotFound(key.to_string())),
            Err(e) => Err(http_error(&op, e)),
        }
    }
}
