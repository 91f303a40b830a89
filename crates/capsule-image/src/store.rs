//! Image repository and per-container overlay roots.
//!
//! Layout under the store root:
//!
//! ```text
//! repositories.json           image id -> layer digest
//! layers/<digest>/            unpacked image, read-only lower dir
//! mounts/<container>/         upper, work, merged, and the image id in use
//! containers/<container>/     hosts, resolv.conf, and the generated bundle
//! volumes/<uuid>/             anonymous volumes
//! ```

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use capsule_common::error::{CapsuleError, Result};
use capsule_core::filesystem::overlayfs::{self, OverlayConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::layer::{self, remove_dir_if_exists};

const REPOSITORIES_FILE: &str = "repositories.json";
const LAYERS_DIR: &str = "layers";
const MOUNTS_DIR: &str = "mounts";
const CONTAINERS_DIR: &str = "containers";
const VOLUMES_DIR: &str = "volumes";
const MOUNT_IMAGE_FILE: &str = "image";
const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Listing entry for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    /// Image id chosen at creation.
    pub id: String,
    /// Digest naming the image's layer.
    pub layer: String,
    /// When the layer was unpacked.
    pub created: DateTime<Utc>,
    /// Bytes of file content in the layer.
    pub size_bytes: u64,
}

/// A host path bind-mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Host side.
    pub source: PathBuf,
    /// Absolute path inside the container.
    pub destination: PathBuf,
}

/// Tar-based image store.
#[derive(Debug)]
pub struct ImageStore {
    root: PathBuf,
    repositories: Mutex<BTreeMap<String, String>>,
}

impl ImageStore {
    /// Opens the store at `root`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be created or the repository
    /// file read, `Serialization` if it is malformed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(LAYERS_DIR))
            .map_err(|e| CapsuleError::io(root.join(LAYERS_DIR), e))?;
        let path = root.join(REPOSITORIES_FILE);
        let repositories = match std::fs::read_to_string(&path) {
            Ok(data) if data.trim().is_empty() => BTreeMap::new(),
            Ok(data) => serde_json::from_str(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(CapsuleError::io(&path, e)),
        };
        tracing::debug!(root = %root.display(), images = repositories.len(), "image store opened");
        Ok(Self {
            root,
            repositories: Mutex::new(repositories),
        })
    }

    /// Store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>> {
        self.repositories.lock().map_err(|_| CapsuleError::Image {
            message: "repository lock poisoned".into(),
        })
    }

    fn persist(&self, repositories: &BTreeMap<String, String>) -> Result<()> {
        let path = self.root.join(REPOSITORIES_FILE);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(repositories)?;
        std::fs::write(&tmp, json).map_err(|e| CapsuleError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| CapsuleError::io(&path, e))
    }

    fn layer_path(&self, digest: &str) -> PathBuf {
        self.root.join(LAYERS_DIR).join(digest)
    }

    fn mount_dir(&self, container_id: &str) -> PathBuf {
        self.root.join(MOUNTS_DIR).join(container_id)
    }

    /// Per-container directory holding generated files and the bundle.
    #[must_use]
    pub fn container_dir(&self, container_id: &str) -> PathBuf {
        self.root.join(CONTAINERS_DIR).join(container_id)
    }

    /// Registers the tarball at `archive` as image `id`.
    ///
    /// # Errors
    ///
    /// Returns `Image` if the id is taken or the archive is not a tar
    /// stream, or `Io` on filesystem failures.
    pub fn create(&self, id: &str, archive: &Path) -> Result<ImageInfo> {
        let _ = capsule_common::types::ContainerId::parse(id).map_err(|_| CapsuleError::Image {
            message: format!("invalid image id: {id:?}"),
        })?;
        let mut repositories = self.lock()?;
        if repositories.contains_key(id) {
            return Err(CapsuleError::Image {
                message: format!("image with id exists: {id}"),
            });
        }
        let layer = layer::extract_layer(archive, &self.root.join(LAYERS_DIR))?;
        let _ = repositories.insert(id.to_owned(), layer.digest.clone());
        self.persist(&repositories)?;
        tracing::info!(id, layer = %layer.digest, "image created");
        info(id, &layer.digest, &layer.path)
    }

    /// Removes image `id`. The layer goes too unless another image shares
    /// it.
    ///
    /// # Errors
    ///
    /// Returns `ImageNotExists` for an unknown id, `Image` while a
    /// container rootfs still uses it, or `Io` on removal failure.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut repositories = self.lock()?;
        let Some(digest) = repositories.get(id).cloned() else {
            return Err(CapsuleError::ImageNotExists { id: id.to_owned() });
        };
        if let Some(container) = self.user_of(id)? {
            return Err(CapsuleError::Image {
                message: format!("image {id} is in use by container {container}"),
            });
        }
        let _ = repositories.remove(id);
        if !repositories.values().any(|d| *d == digest) {
            remove_dir_if_exists(&self.layer_path(&digest))?;
        }
        self.persist(&repositories)?;
        tracing::info!(id, "image deleted");
        Ok(())
    }

    fn user_of(&self, id: &str) -> Result<Option<String>> {
        let mounts = self.root.join(MOUNTS_DIR);
        let entries = match std::fs::read_dir(&mounts) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CapsuleError::io(&mounts, e)),
        };
        for entry in entries.filter_map(std::result::Result::ok) {
            let image = std::fs::read_to_string(entry.path().join(MOUNT_IMAGE_FILE))
                .unwrap_or_default();
            if image == id {
                return Ok(Some(entry.file_name().to_string_lossy().into_owned()));
            }
        }
        Ok(None)
    }

    /// Every image, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a layer directory is missing or unreadable.
    pub fn list(&self) -> Result<Vec<ImageInfo>> {
        let repositories = self.lock()?;
        repositories
            .iter()
            .map(|(id, digest)| info(id, digest, &self.layer_path(digest)))
            .collect()
    }

    /// One image.
    ///
    /// # Errors
    ///
    /// Returns `ImageNotExists` if the id is unknown or its layer is gone.
    pub fn get(&self, id: &str) -> Result<ImageInfo> {
        let digest = self
            .lock()?
            .get(id)
            .cloned()
            .ok_or_else(|| CapsuleError::ImageNotExists { id: id.to_owned() })?;
        let path = self.layer_path(&digest);
        if !path.is_dir() {
            return Err(CapsuleError::ImageNotExists { id: id.to_owned() });
        }
        info(id, &digest, &path)
    }

    /// Overlay directories a container of `image_id` would use.
    ///
    /// # Errors
    ///
    /// Returns `ImageNotExists` if the image is unknown.
    pub fn overlay_config(&self, container_id: &str, image_id: &str) -> Result<OverlayConfig> {
        let digest = self
            .lock()?
            .get(image_id)
            .cloned()
            .ok_or_else(|| CapsuleError::ImageNotExists {
                id: image_id.to_owned(),
            })?;
        let dir = self.mount_dir(container_id);
        Ok(OverlayConfig {
            lower_dirs: vec![self.layer_path(&digest)],
            upper_dir: dir.join("upper"),
            work_dir: dir.join("work"),
            merged_dir: dir.join("merged"),
        })
    }

    /// Mounts a writable overlay of `image_id` for `container_id` and
    /// returns the merged directory to use as rootfs.
    ///
    /// # Errors
    ///
    /// Returns `ImageNotExists` for an unknown image, `Image` if the
    /// container already has a rootfs, or `Mount` if the overlay fails.
    pub fn prepare_rootfs(&self, container_id: &str, image_id: &str) -> Result<PathBuf> {
        let config = self.overlay_config(container_id, image_id)?;
        if let Some(lower) = config.lower_dirs.first().filter(|p| !p.is_dir()) {
            tracing::warn!(path = %lower.display(), "image layer missing");
            return Err(CapsuleError::ImageNotExists {
                id: image_id.to_owned(),
            });
        }
        let dir = self.mount_dir(container_id);
        if dir.exists() {
            return Err(CapsuleError::Image {
                message: format!("container {container_id} already has a rootfs"),
            });
        }
        std::fs::create_dir_all(&dir).map_err(|e| CapsuleError::io(&dir, e))?;
        let marker = dir.join(MOUNT_IMAGE_FILE);
        let mounted = std::fs::write(&marker, image_id)
            .map_err(|e| CapsuleError::io(&marker, e))
            .and_then(|()| overlayfs::mount_overlay(&config));
        if let Err(e) = mounted {
            if let Err(cleanup) = remove_dir_if_exists(&dir) {
                tracing::warn!(error = %cleanup, "failed to remove overlay directories");
            }
            return Err(e);
        }
        tracing::info!(container = container_id, image = image_id, "rootfs prepared");
        Ok(config.merged_dir)
    }

    /// Writes `/etc/hosts` and `/etc/resolv.conf` replacements for a
    /// container and returns them as bind mounts. `links` are extra
    /// `(address, alias)` host entries.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a file cannot be written.
    pub fn prepare_etc(
        &self,
        container_id: &str,
        links: &[(Ipv4Addr, String)],
    ) -> Result<Vec<BindMount>> {
        let dir = self.container_dir(container_id);
        std::fs::create_dir_all(&dir).map_err(|e| CapsuleError::io(&dir, e))?;

        let hosts = dir.join("hosts");
        let mut content = String::from("127.0.0.1 localhost\n");
        for (ip, alias) in links {
            content.push_str(&format!("{ip} {alias}\n"));
        }
        std::fs::write(&hosts, content).map_err(|e| CapsuleError::io(&hosts, e))?;

        let resolv = dir.join("resolv.conf");
        let dns = std::fs::read(HOST_RESOLV_CONF).unwrap_or_default();
        std::fs::write(&resolv, dns).map_err(|e| CapsuleError::io(&resolv, e))?;

        Ok(vec![
            BindMount {
                source: hosts,
                destination: PathBuf::from("/etc/hosts"),
            },
            BindMount {
                source: resolv,
                destination: PathBuf::from("/etc/resolv.conf"),
            },
        ])
    }

    /// Resolves a volume argument. `host:container` binds an existing host
    /// directory; a bare container path gets a fresh anonymous volume.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` for a relative container path or a missing
    /// host directory, or `Io` if the anonymous volume cannot be created.
    pub fn prepare_volume(&self, volume: &str) -> Result<BindMount> {
        let (host, destination) = match volume.split_once(':') {
            Some((host, container)) => (Some(PathBuf::from(host)), PathBuf::from(container)),
            None => (None, PathBuf::from(volume)),
        };
        if !destination.is_absolute() {
            return Err(CapsuleError::ConfigInvalid {
                message: format!("volume destination {} must be absolute", destination.display()),
            });
        }
        let source = match host {
            Some(host) if host.is_dir() => host,
            Some(host) => {
                return Err(CapsuleError::ConfigInvalid {
                    message: format!("volume source {} does not exist", host.display()),
                });
            }
            None => {
                let anon = self
                    .root
                    .join(VOLUMES_DIR)
                    .join(uuid::Uuid::new_v4().simple().to_string());
                std::fs::create_dir_all(&anon).map_err(|e| CapsuleError::io(&anon, e))?;
                anon
            }
        };
        Ok(BindMount {
            source,
            destination,
        })
    }

    /// Unmounts and removes everything [`Self::prepare_rootfs`] and
    /// [`Self::prepare_etc`] created for `container_id`. Safe to call on a
    /// container that has none of it.
    ///
    /// # Errors
    ///
    /// Returns `Mount` if the overlay cannot be unmounted or `Io` if a
    /// directory cannot be removed.
    pub fn cleanup(&self, container_id: &str) -> Result<()> {
        let dir = self.mount_dir(container_id);
        if dir.join("merged").exists() {
            overlayfs::unmount_overlay(&dir.join("merged"))?;
        }
        remove_dir_if_exists(&dir)?;
        remove_dir_if_exists(&self.container_dir(container_id))?;
        tracing::info!(container = container_id, "image rootfs cleaned up");
        Ok(())
    }
}

fn info(id: &str, digest: &str, path: &Path) -> Result<ImageInfo> {
    let meta = std::fs::metadata(path).map_err(|e| CapsuleError::io(path, e))?;
    let created = meta
        .modified()
        .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);
    Ok(ImageInfo {
        id: id.to_owned(),
        layer: digest.to_owned(),
        created,
        size_bytes: layer::dir_size(path)?,
    })
}

#[cfg(test)]
mod tests {
    use capsule_common::error::ErrorKind;

    use super::*;
    use crate::layer::tests::create_test_tar;

    fn store(dir: &tempfile::TempDir) -> ImageStore {
        ImageStore::open(dir.path().join("images")).expect("open")
    }

    #[test]
    fn create_registers_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tar = create_test_tar(dir.path(), "busybox.tar");
        let store = store(&dir);

        let info = store.create("busybox", &tar).expect("create");
        assert_eq!(info.id, "busybox");
        assert_eq!(info.layer, crate::hash::hash_file(&tar).unwrap());
        assert!(info.size_bytes > 0);

        let reopened = ImageStore::open(store.root()).expect("reopen");
        assert_eq!(reopened.get("busybox").unwrap().layer, info.layer);
        let raw = std::fs::read_to_string(store.root().join(REPOSITORIES_FILE)).unwrap();
        let map: BTreeMap<String, String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(map.get("busybox"), Some(&info.layer));
    }

    #[test]
    fn duplicate_or_invalid_ids_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tar = create_test_tar(dir.path(), "busybox.tar");
        let store = store(&dir);
        let _ = store.create("busybox", &tar).expect("create");

        let err = store.create("busybox", &tar).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Image);
        let err = store.create("../x", &tar).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Image);
    }

    #[test]
    fn list_is_sorted_by_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tar = create_test_tar(dir.path(), "base.tar");
        let store = store(&dir);
        let _ = store.create("zeta", &tar).unwrap();
        let _ = store.create("alpha", &tar).unwrap();

        let ids: Vec<_> = store.list().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[test]
    fn shared_layer_survives_until_last_image_is_deleted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tar = create_test_tar(dir.path(), "base.tar");
        let store = store(&dir);
        let a = store.create("a", &tar).unwrap();
        let _ = store.create("b", &tar).unwrap();
        let layer = store.layer_path(&a.layer);

        store.delete("a").expect("delete a");
        assert!(layer.is_dir());
        assert_eq!(store.get("a").unwrap_err().kind(), ErrorKind::ImageNotExists);

        store.delete("b").expect("delete b");
        assert!(!layer.exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn delete_of_unknown_image_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = store(&dir).delete("ghost").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImageNotExists);
    }

    #[test]
    fn image_in_use_cannot_be_deleted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tar = create_test_tar(dir.path(), "base.tar");
        let store = store(&dir);
        let _ = store.create("base", &tar).unwrap();
        let mount_dir = store.mount_dir("web");
        std::fs::create_dir_all(&mount_dir).unwrap();
        std::fs::write(mount_dir.join(MOUNT_IMAGE_FILE), "base").unwrap();

        let err = store.delete("base").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Image);
        assert!(err.to_string().contains("web"));

        store.cleanup("web").expect("cleanup");
        store.delete("base").expect("delete after cleanup");
    }

    #[test]
    fn overlay_config_uses_layer_as_lower_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tar = create_test_tar(dir.path(), "base.tar");
        let store = store(&dir);
        let info = store.create("base", &tar).unwrap();

        let config = store.overlay_config("web", "base").unwrap();
        assert_eq!(config.lower_dirs, vec![store.layer_path(&info.layer)]);
        assert!(config.upper_dir.starts_with(store.mount_dir("web")));
        assert_eq!(config.merged_dir, store.mount_dir("web").join("merged"));

        let err = store.prepare_rootfs("web", "ghost").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImageNotExists);
    }

    #[test]
    fn etc_files_include_links() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let mounts = store
            .prepare_etc("web", &[(Ipv4Addr::new(10, 0, 0, 7), "db".into())])
            .expect("etc");
        assert_eq!(mounts[0].destination, Path::new("/etc/hosts"));
        let hosts = std::fs::read_to_string(&mounts[0].source).unwrap();
        assert_eq!(hosts, "127.0.0.1 localhost\n10.0.0.7 db\n");
        assert!(mounts[1].source.exists());

        store.cleanup("web").expect("cleanup");
        assert!(!store.container_dir("web").exists());
    }

    #[test]
    fn volumes_bind_existing_dirs_or_create_anonymous_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let host = dir.path().join("data");
        std::fs::create_dir_all(&host).unwrap();

        let named = store
            .prepare_volume(&format!("{}:/data", host.display()))
            .expect("named");
        assert_eq!(named.source, host);
        assert_eq!(named.destination, Path::new("/data"));

        let anon = store.prepare_volume("/cache").expect("anonymous");
        assert!(anon.source.is_dir());
        assert!(anon.source.starts_with(store.root().join(VOLUMES_DIR)));

        let err = store.prepare_volume("/missing/host:/data").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        let err = store.prepare_volume("relative").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }
}
