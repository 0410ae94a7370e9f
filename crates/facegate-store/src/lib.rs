//! facegate-store: SQLite-backed member gallery.
//!
//! One `members` table holds identity fields and two BLOBs: the 200×200
//! grayscale template and the optional 200×200 RGB display crop. Email is
//! unique without regard to ASCII case.

use facegate_core::{
    DisplayImage, FaceTemplate, Gallery, GalleryError, MemberId, MemberRecord, MemberSummary,
    NewMember,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS members (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    first_name    TEXT NOT NULL,
    last_name     TEXT NOT NULL,
    email         TEXT NOT NULL UNIQUE COLLATE NOCASE,
    phone         TEXT,
    face_data     BLOB NOT NULL,
    face_image    BLOB,
    registered_at TEXT NOT NULL
);
";

const MEMBER_COLUMNS: &str =
    "id, first_name, last_name, email, phone, face_data, face_image, registered_at";

pub struct SqliteGallery {
    conn: Mutex<Connection>,
}

impl SqliteGallery {
    /// Open (creating if needed) the gallery database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GalleryError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(GalleryError::unavailable)?;
        let gallery = Self::init(conn)?;
        tracing::info!(path = %path.display(), "gallery opened");
        Ok(gallery)
    }

    pub fn open_in_memory() -> Result<Self, GalleryError> {
        Self::init(Connection::open_in_memory().map_err(GalleryError::unavailable)?)
    }

    fn init(conn: Connection) -> Result<Self, GalleryError> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(GalleryError::unavailable)?;
        conn.execute_batch(SCHEMA).map_err(GalleryError::unavailable)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, GalleryError> {
        self.conn
            .lock()
            .map_err(|_| GalleryError::unavailable("gallery connection lock poisoned"))
    }
}

/// A `members` row before its BLOBs are validated.
struct RawMember {
    id: i64,
    first_name: String,
    last_name: String,
    email: String,
    phone: Option<String>,
    face_data: Vec<u8>,
    face_image: Option<Vec<u8>>,
    registered_at: String,
}

impl RawMember {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            email: row.get(3)?,
            phone: row.get(4)?,
            face_data: row.get(5)?,
            face_image: row.get(6)?,
            registered_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<MemberRecord, GalleryError> {
        let id = MemberId(self.id);
        Ok(MemberRecord {
            id,
            template: template_from_blob(id, self.face_data)?,
            display: display_from_blob(id, self.face_image)?,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            phone: self.phone,
            registered_at: self.registered_at,
        })
    }
}

fn template_from_blob(id: MemberId, blob: Vec<u8>) -> Result<FaceTemplate, GalleryError> {
    FaceTemplate::from_pixels(blob).map_err(|e| GalleryError::Corrupt {
        id,
        message: format!("face template: {e}"),
    })
}

fn display_from_blob(id: MemberId, blob: Option<Vec<u8>>) -> Result<Option<DisplayImage>, GalleryError> {
    blob.map(|b| {
        DisplayImage::from_pixels(b).map_err(|e| GalleryError::Corrupt {
            id,
            message: format!("display image: {e}"),
        })
    })
    .transpose()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl Gallery for SqliteGallery {
    fn insert(&self, member: NewMember) -> Result<MemberId, GalleryError> {
        let conn = self.conn()?;
        let reg = member.registration;
        let inserted = conn.execute(
            "INSERT INTO members (first_name, last_name, email, phone, face_data, face_image, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                reg.first_name,
                reg.last_name,
                reg.email,
                reg.phone,
                member.template.pixels(),
                member.display.as_ref().map(|d| d.pixels()),
                chrono::Utc::now().to_rfc3339(),
            ],
        );
        match inserted {
            Ok(_) => Ok(MemberId(conn.last_insert_rowid())),
            Err(e) if is_unique_violation(&e) => Err(GalleryError::DuplicateIdentity { email: reg.email }),
            Err(e) => Err(GalleryError::unavailable(e)),
        }
    }

    fn all_templates(&self) -> Result<Vec<(MemberId, FaceTemplate)>, GalleryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, face_data FROM members ORDER BY id")
            .map_err(GalleryError::unavailable)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))
            .map_err(GalleryError::unavailable)?;

        let mut templates = Vec::new();
        for row in rows {
            let (id, blob) = row.map_err(GalleryError::unavailable)?;
            let id = MemberId(id);
            templates.push((id, template_from_blob(id, blob)?));
        }
        Ok(templates)
    }

    fn by_id(&self, id: MemberId) -> Result<Option<MemberRecord>, GalleryError> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {MEMBER_COLUMNS} FROM members WHERE id = ?1"),
                params![id.0],
                RawMember::from_row,
            )
            .optional()
            .map_err(GalleryError::unavailable)?;
        raw.map(RawMember::into_record).transpose()
    }

    fn delete(&self, id: MemberId) -> Result<bool, GalleryError> {
        let conn = self.conn()?;
        let removed = conn
            .execute("DELETE FROM members WHERE id = ?1", params![id.0])
            .map_err(GalleryError::unavailable)?;
        Ok(removed > 0)
    }

    fn list(&self) -> Result<Vec<MemberSummary>, GalleryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, first_name, last_name, email, phone, registered_at, face_image IS NOT NULL
                 FROM members ORDER BY id",
            )
            .map_err(GalleryError::unavailable)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MemberSummary {
                    id: MemberId(row.get(0)?),
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                    email: row.get(3)?,
                    phone: row.get(4)?,
                    registered_at: row.get(5)?,
                    has_photo: row.get(6)?,
                })
            })
            .map_err(GalleryError::unavailable)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(GalleryError::unavailable)
    }

    fn display_image(&self, id: MemberId) -> Result<Option<DisplayImage>, GalleryError> {
        let conn = self.conn()?;
        let blob: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT face_image FROM members WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(GalleryError::unavailable)?;
        display_from_blob(id, blob.flatten())
    }

    fn count(&self) -> Result<usize, GalleryError> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM members", [], |row| row.get(0))
            .map_err(GalleryError::unavailable)?;
        Ok(n as usize)
    }
}
