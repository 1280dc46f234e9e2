// HLS decryption: AES-128 key cache, IV derivation and segment decryption.

use std::future::Future;

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use moka::future::Cache;
use tracing::debug;
use url::Url;

use crate::error::StreamError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Default IV: the media sequence number as a 16 byte big-endian integer.
pub fn sequence_iv(sequence: u64) -> [u8; 16] {
    u128::from(sequence).to_be_bytes()
}

/// Decrypt an AES-128-CBC segment with PKCS#7 padding.
pub fn decrypt_segment(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<Bytes, StreamError> {
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(StreamError::decryption(format!(
            "ciphertext length {} is not a multiple of the block size",
            data.len()
        )));
    }
    let mut buffer = data.to_vec();
    let plain_len = Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| StreamError::decryption(format!("decryption failed: {e}")))?
        .len();
    buffer.truncate(plain_len);
    Ok(Bytes::from(buffer))
}

/// Rewrites key URIs through a template such as `https://keys.example/{path}?{query}`.
///
/// Placeholders: `{url}`, `{scheme}`, `{netloc}`, `{path}`, `{query}`.
#[derive(Debug, Clone)]
pub struct KeyUriTemplate {
    template: String,
}

impl KeyUriTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn apply(&self, key_url: &Url) -> String {
        let netloc = match (key_url.host_str(), key_url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };
        self.template
            .replace("{url}", key_url.as_str())
            .replace("{scheme}", key_url.scheme())
            .replace("{netloc}", &netloc)
            .replace("{path}", key_url.path().trim_start_matches('/'))
            .replace("{query}", key_url.query().unwrap_or_default())
    }
}

type KeyId = (String, Option<[u8; 16]>);

/// Keys of one open stream, keyed by (URI, explicit IV).
///
/// Concurrent requests for the same key share one fetch.
#[derive(Clone)]
pub struct KeyCache {
    cache: Cache<KeyId, [u8; 16]>,
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyCache {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder().max_capacity(64).build(),
        }
    }

    /// Cached key for `uri`, calling `fetch` on a miss.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        uri: &str,
        iv: Option<[u8; 16]>,
        fetch: F,
    ) -> Result<[u8; 16], StreamError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, StreamError>>,
    {
        let id = (uri.to_string(), iv);
        self.cache
            .try_get_with(id, async {
                let raw = fetch().await?;
                let key: [u8; 16] = raw.as_ref().try_into().map_err(|_| {
                    StreamError::decryption(format!(
                        "key from {uri} has {} bytes, expected 16",
                        raw.len()
                    ))
                })?;
                debug!(uri, "Fetched decryption key");
                Ok::<_, StreamError>(key)
            })
            .await
            .map_err(|e| StreamError::decryption(format!("could not load key {uri}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        use cipher::BlockEncryptMut;
        let padded_len = (plaintext.len() / 16 + 1) * 16;
        let mut buffer = vec![0u8; padded_len];
        buffer[..plaintext.len()].copy_from_slice(plaintext);
        Aes128CbcEnc::new(key.into(), iv.into())
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .unwrap()
            .to_vec()
    }

    #[test]
    fn sequence_iv_is_big_endian() {
        assert_eq!(sequence_iv(0), [0u8; 16]);
        let iv = sequence_iv(0x0102);
        assert_eq!(&iv[..14], &[0u8; 14]);
        assert_eq!(&iv[14..], &[0x01, 0x02]);
    }

    #[test]
    fn decrypts_with_padding() {
        let key = [0x11; 16];
        let iv = sequence_iv(42);
        let plaintext = b"transport stream payload, not block aligned";
        let ciphertext = encrypt(plaintext, &key, &iv);
        assert_eq!(decrypt_segment(&ciphertext, &key, &iv).unwrap(), &plaintext[..]);
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let key = [0x11; 16];
        let iv = [0u8; 16];
        let ciphertext = encrypt(b"0123456789", &key, &iv);
        assert!(decrypt_segment(&ciphertext[..10], &key, &iv).is_err());
        assert!(decrypt_segment(&[], &key, &iv).is_err());
    }

    #[test]
    fn key_uri_template() {
        let url = Url::parse("https://keys.example.com:8443/live/key.bin?token=abc").unwrap();
        let template = KeyUriTemplate::new("https://proxy.local/{netloc}/{path}?{query}");
        assert_eq!(
            template.apply(&url),
            "https://proxy.local/keys.example.com:8443/live/key.bin?token=abc"
        );
        assert_eq!(KeyUriTemplate::new("{url}").apply(&url), url.as_str());
        assert_eq!(KeyUriTemplate::new("{scheme}").apply(&url), "https");
    }

    #[tokio::test]
    async fn concurrent_lookups_fetch_once() {
        let cache = KeyCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let lookups = (0..8).map(|_| {
            let calls = calls.clone();
            let cache = cache.clone();
            async move {
                cache
                    .get_or_fetch("https://k/1", None, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(Bytes::from_static(&[7u8; 16]))
                    })
                    .await
            }
        });
        for key in futures::future::join_all(lookups).await {
            assert_eq!(key.unwrap(), [7u8; 16]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A different explicit IV is a different entry.
        cache
            .get_or_fetch("https://k/1", Some([1; 16]), || async {
                Ok(Bytes::from_static(&[8u8; 16]))
            })
            .await
            .unwrap();
        cache.cache.run_pending_tasks().await;
        assert_eq!(cache.cache.entry_count(), 2);
    }

    #[tokio::test]
    async fn short_key_is_rejected() {
        let cache = KeyCache::new();
        let result = cache
            .get_or_fetch("https://k/short", None, || async {
                Ok(Bytes::from_static(&[1u8; 8]))
            })
            .await;
        assert!(matches!(result, Err(StreamError::Decryption { .. })));
    }
}
