//! 파일 저장소
//!
//! 세션이 목록/읽기/삭제/저장 경로를 얻는 추상화와 디렉터리 기반 구현.
//! 수신 완료된 파일은 같은 디렉터리의 임시 파일에 쓴 뒤 rename으로 원자적으로 교체한다.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::{Error, Result};

/// 세션이 사용하는 파일 저장소
pub trait FileStore: Send + Sync {
    /// 저장된 파일 이름 목록 (정렬됨)
    fn list(&self) -> Result<Vec<String>>;

    fn read(&self, name: &str) -> Result<Bytes>;

    fn delete(&self, name: &str) -> Result<()>;

    /// 수신 파일을 저장할 경로
    fn destination(&self, name: &str) -> Result<PathBuf>;
}

/// 디렉터리 하나를 루트로 하는 저장소
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// 루트 디렉터리가 없으면 생성
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!("File store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\'])
            && !name.starts_with(".tmp");
        if !valid {
            return Err(Error::Store(format!("유효하지 않은 파일 이름: {name:?}")));
        }
        Ok(self.root.join(name))
    }
}

impl FileStore for DirStore {
    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                // 진행 중인 임시 파일은 제외
                if !name.starts_with(".tmp") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, name: &str) -> Result<Bytes> {
        let path = self.path_of(name)?;
        if !path.is_file() {
            return Err(Error::Store(format!("파일 없음: {name}")));
        }
        Ok(Bytes::from(fs::read(path)?))
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_of(name)?;
        if !path.is_file() {
            return Err(Error::Store(format!("파일 없음: {name}")));
        }
        fs::remove_file(path)?;
        debug!("삭제: {}", name);
        Ok(())
    }

    fn destination(&self, name: &str) -> Result<PathBuf> {
        self.path_of(name)
    }
}

/// 같은 디렉터리의 임시 파일에 쓴 뒤 대상 경로로 교체
pub fn persist_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| Error::Io(e.error))?;

    debug!("저장 완료: {} ({} bytes)", path.display(), data.len());
    Ok(())
}
