//! Directory-backed media library.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{LibraryError, MediaFile, STAGING_PREFIX, STAGING_SUFFIX};

/// Read-mostly view over the library directory.
///
/// Cheap to clone; every operation goes to the file system, nothing is
/// cached, so concurrent writers from other requests are always visible.
#[derive(Debug, Clone)]
pub struct MediaLibrary {
    directory: PathBuf,
}

impl MediaLibrary {
    /// Creates a library rooted at `directory` without touching the disk.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Creates a library rooted at `directory`, creating it if missing.
    ///
    /// # Errors
    /// - `LibraryError::Directory` - Directory could not be created
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self, LibraryError> {
        let library = Self::new(directory);
        tokio::fs::create_dir_all(&library.directory)
            .await
            .map_err(|source| LibraryError::Directory {
                path: library.directory.clone(),
                source,
            })?;
        Ok(library)
    }

    /// Root directory of the library.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Resolves a file name to its path inside the library.
    ///
    /// # Errors
    /// - `LibraryError::InvalidName` - Empty name, path separators or dot segments
    pub fn path_for(&self, name: &str) -> Result<PathBuf, LibraryError> {
        validate_name(name)?;
        Ok(self.directory.join(name))
    }

    /// Checks whether a complete file with this name is in the library.
    pub async fn contains(&self, name: &str) -> bool {
        match self.path_for(name) {
            Ok(path) => tokio::fs::metadata(path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Looks up a single file.
    ///
    /// # Errors
    /// - `LibraryError::InvalidName` - Name cannot live in the library
    /// - `LibraryError::NotFound` - No such file
    pub async fn media_file(&self, name: &str) -> Result<MediaFile, LibraryError> {
        let path = self.path_for(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(MediaFile {
                name: name.to_string(),
                size: metadata.len(),
            }),
            Ok(_) => Err(LibraryError::NotFound {
                name: name.to_string(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(LibraryError::NotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(LibraryError::Io(e)),
        }
    }

    /// Lists every complete file in directory iteration order.
    ///
    /// In-flight staging files and subdirectories are skipped.
    ///
    /// # Errors
    /// - `LibraryError::Directory` - Directory cannot be read
    pub async fn list(&self) -> Result<Vec<MediaFile>, LibraryError> {
        let mut entries =
            tokio::fs::read_dir(&self.directory)
                .await
                .map_err(|source| LibraryError::Directory {
                    path: self.directory.clone(),
                    source,
                })?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::debug!("Skipping non UTF-8 library entry {:?}", entry.file_name());
                continue;
            };
            if is_staging_name(&name) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // Removed between read_dir and stat
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(LibraryError::Io(e)),
            };
            if metadata.is_file() {
                files.push(MediaFile {
                    name,
                    size: metadata.len(),
                });
            }
        }

        Ok(files)
    }

    /// Moves `source` into the library under `name`.
    ///
    /// Uses a rename so readers never see a partial destination. When the
    /// source lives on another file system the content is first copied to a
    /// staging file inside the library and then renamed into place. An
    /// existing file with the same name is replaced atomically.
    ///
    /// # Errors
    /// - `LibraryError::InvalidName` - Name cannot live in the library
    /// - `LibraryError::Relocation` - Rename or fallback copy failed
    pub async fn relocate(&self, source: &Path, name: &str) -> Result<MediaFile, LibraryError> {
        let destination = self.path_for(name)?;
        self.ensure_directory().await?;

        match tokio::fs::rename(source, &destination).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::CrossesDevices => {
                tracing::debug!(
                    "{} is on another device, staging copy before rename",
                    source.display()
                );
                let staging = self.staging_path(name)?;
                if let Err(source_err) = tokio::fs::copy(source, &staging).await {
                    self.discard(&staging).await;
                    return Err(LibraryError::Relocation {
                        name: name.to_string(),
                        source: source_err,
                    });
                }
                self.commit(&staging, name).await?;
                if let Err(e) = tokio::fs::remove_file(source).await {
                    tracing::warn!("Failed to remove {} after copy: {}", source.display(), e);
                }
            }
            Err(source) => {
                return Err(LibraryError::Relocation {
                    name: name.to_string(),
                    source,
                });
            }
        }

        tracing::info!("Relocated {} into library", name);
        self.media_file(name).await
    }

    /// Returns a fresh hidden path inside the library for writing `name`.
    ///
    /// The path is never listed and never matches a playable name, so it can
    /// be written incrementally and later published with [`Self::commit`].
    ///
    /// # Errors
    /// - `LibraryError::InvalidName` - Name cannot live in the library
    pub fn staging_path(&self, name: &str) -> Result<PathBuf, LibraryError> {
        validate_name(name)?;
        Ok(self.directory.join(format!(
            "{STAGING_PREFIX}{}-{name}{STAGING_SUFFIX}",
            uuid::Uuid::new_v4().simple()
        )))
    }

    /// Publishes a staging file under its final name.
    ///
    /// # Errors
    /// - `LibraryError::InvalidName` - Name cannot live in the library
    /// - `LibraryError::Relocation` - Rename failed; the staging file is removed
    pub async fn commit(&self, staging: &Path, name: &str) -> Result<MediaFile, LibraryError> {
        let destination = self.path_for(name)?;
        if let Err(source) = tokio::fs::rename(staging, &destination).await {
            self.discard(staging).await;
            return Err(LibraryError::Relocation {
                name: name.to_string(),
                source,
            });
        }
        self.media_file(name).await
    }

    /// Removes a staging file, ignoring errors.
    pub async fn discard(&self, staging: &Path) {
        match tokio::fs::remove_file(staging).await {
            Ok(()) => tracing::debug!("Discarded {}", staging.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to discard {}: {}", staging.display(), e),
        }
    }

    async fn ensure_directory(&self) -> Result<(), LibraryError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|source| LibraryError::Directory {
                path: self.directory.clone(),
                source,
            })
    }
}

fn is_staging_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX) && name.ends_with(STAGING_SUFFIX)
}

fn validate_name(name: &str) -> Result<(), LibraryError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || is_staging_name(name);
    if invalid {
        return Err(LibraryError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}
