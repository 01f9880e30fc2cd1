//! Typed per-table record schemas.
//!
//! Record payloads travel between the stores as strongly-typed
//! structs rather than untyped JSON blobs. Every schema exposes an
//! explicit field diff (`changed_fields`) and a field-wise merge
//! (`merged_with`), which is what the conflict resolver operates on.

use crate::error::{ProtocolError, ProtocolResult};
use crate::event::SyncTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A patient master record (`pacientes`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    /// Record id, shared by both stores.
    pub id: String,
    /// Given name.
    pub nombre: String,
    /// Family name(s).
    pub apellidos: String,
    /// Contact phone number.
    pub telefono: Option<String>,
    /// Contact email.
    pub email: Option<String>,
    /// Postal address.
    pub direccion: Option<String>,
    /// Known allergies. Clinical-safety field.
    pub alergias: Vec<String>,
    /// Current medication. Clinical-safety field.
    pub medicacion: Vec<String>,
    /// When the record was last modified in its store.
    pub updated_at: DateTime<Utc>,
}

impl PatientRecord {
    /// Creates a minimal patient record.
    pub fn new(
        id: impl Into<String>,
        nombre: impl Into<String>,
        apellidos: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            nombre: nombre.into(),
            apellidos: apellidos.into(),
            telefono: None,
            email: None,
            direccion: None,
            alergias: Vec::new(),
            medicacion: Vec::new(),
            updated_at,
        }
    }

    /// Returns the names of data fields whose values differ between
    /// `self` and `other`. `id` and `updated_at` are not data fields.
    pub fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.nombre != other.nombre {
            changed.push("nombre");
        }
        if self.apellidos != other.apellidos {
            changed.push("apellidos");
        }
        if self.telefono != other.telefono {
            changed.push("telefono");
        }
        if self.email != other.email {
            changed.push("email");
        }
        if self.direccion != other.direccion {
            changed.push("direccion");
        }
        if self.alergias != other.alergias {
            changed.push("alergias");
        }
        if self.medicacion != other.medicacion {
            changed.push("medicacion");
        }
        changed
    }

    /// Returns a copy of `self` with the named fields taken from
    /// `other`. `updated_at` becomes the later of the two.
    pub fn merged_with(&self, other: &Self, take: &[&str]) -> Self {
        let mut merged = self.clone();
        for field in take {
            match *field {
                "nombre" => merged.nombre = other.nombre.clone(),
                "apellidos" => merged.apellidos = other.apellidos.clone(),
                "telefono" => merged.telefono = other.telefono.clone(),
                "email" => merged.email = other.email.clone(),
                "direccion" => merged.direccion = other.direccion.clone(),
                "alergias" => merged.alergias = other.alergias.clone(),
                "medicacion" => merged.medicacion = other.medicacion.clone(),
                _ => {}
            }
        }
        merged.updated_at = self.updated_at.max(other.updated_at);
        merged
    }
}

/// An appointment record (`citas`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentRecord {
    /// Record id, shared by both stores.
    pub id: String,
    /// The patient the appointment is for.
    pub patient_id: String,
    /// The practitioner the appointment is with.
    pub doctor_id: String,
    /// Scheduled start.
    pub starts_at: DateTime<Utc>,
    /// Scheduled end.
    pub ends_at: DateTime<Utc>,
    /// Appointment state (`programada`, `confirmada`, `cancelada`, ...).
    pub estado: String,
    /// Free-form notes.
    pub notas: Option<String>,
    /// Billed amount in cents. Monetary field, never auto-resolved.
    pub importe_cents: Option<i64>,
    /// When the record was last modified in its store.
    pub updated_at: DateTime<Utc>,
}

impl AppointmentRecord {
    /// Returns the names of data fields whose values differ.
    pub fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.patient_id != other.patient_id {
            changed.push("patient_id");
        }
        if self.doctor_id != other.doctor_id {
            changed.push("doctor_id");
        }
        if self.starts_at != other.starts_at {
            changed.push("starts_at");
        }
        if self.ends_at != other.ends_at {
            changed.push("ends_at");
        }
        if self.estado != other.estado {
            changed.push("estado");
        }
        if self.notas != other.notas {
            changed.push("notas");
        }
        if self.importe_cents != other.importe_cents {
            changed.push("importe_cents");
        }
        changed
    }

    /// Returns a copy of `self` with the named fields taken from `other`.
    pub fn merged_with(&self, other: &Self, take: &[&str]) -> Self {
        let mut merged = self.clone();
        for field in take {
            match *field {
                "patient_id" => merged.patient_id = other.patient_id.clone(),
                "doctor_id" => merged.doctor_id = other.doctor_id.clone(),
                "starts_at" => merged.starts_at = other.starts_at,
                "ends_at" => merged.ends_at = other.ends_at,
                "estado" => merged.estado = other.estado.clone(),
                "notas" => merged.notas = other.notas.clone(),
                "importe_cents" => merged.importe_cents = other.importe_cents,
                _ => {}
            }
        }
        merged.updated_at = self.updated_at.max(other.updated_at);
        merged
    }
}

/// A practitioner record (`doctores`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoctorRecord {
    /// Record id, shared by both stores.
    pub id: String,
    /// Full name.
    pub nombre: String,
    /// Specialty.
    pub especialidad: String,
    /// Contact phone number.
    pub telefono: Option<String>,
    /// Contact email.
    pub email: Option<String>,
    /// When the record was last modified in its store.
    pub updated_at: DateTime<Utc>,
}

impl DoctorRecord {
    /// Returns the names of data fields whose values differ.
    pub fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.nombre != other.nombre {
            changed.push("nombre");
        }
        if self.especialidad != other.especialidad {
            changed.push("especialidad");
        }
        if self.telefono != other.telefono {
            changed.push("telefono");
        }
        if self.email != other.email {
            changed.push("email");
        }
        changed
    }

    /// Returns a copy of `self` with the named fields taken from `other`.
    pub fn merged_with(&self, other: &Self, take: &[&str]) -> Self {
        let mut merged = self.clone();
        for field in take {
            match *field {
                "nombre" => merged.nombre = other.nombre.clone(),
                "especialidad" => merged.especialidad = other.especialidad.clone(),
                "telefono" => merged.telefono = other.telefono.clone(),
                "email" => merged.email = other.email.clone(),
                _ => {}
            }
        }
        merged.updated_at = self.updated_at.max(other.updated_at);
        merged
    }
}

/// A record snapshot from either store, tagged by table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum RecordPayload {
    /// A `pacientes` row.
    Pacientes(PatientRecord),
    /// A `citas` row.
    Citas(AppointmentRecord),
    /// A `doctores` row.
    Doctores(DoctorRecord),
}

impl RecordPayload {
    /// Returns the table this payload belongs to.
    pub fn table(&self) -> SyncTable {
        match self {
            RecordPayload::Pacientes(_) => SyncTable::Pacientes,
            RecordPayload::Citas(_) => SyncTable::Citas,
            RecordPayload::Doctores(_) => SyncTable::Doctores,
        }
    }

    /// Returns the record id.
    pub fn id(&self) -> &str {
        match self {
            RecordPayload::Pacientes(r) => &r.id,
            RecordPayload::Citas(r) => &r.id,
            RecordPayload::Doctores(r) => &r.id,
        }
    }

    /// Returns the record's last-modified timestamp.
    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            RecordPayload::Pacientes(r) => r.updated_at,
            RecordPayload::Citas(r) => r.updated_at,
            RecordPayload::Doctores(r) => r.updated_at,
        }
    }

    /// Returns the names of data fields that differ between `self`
    /// and `other`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TableMismatch`] if the payloads belong
    /// to different tables.
    pub fn changed_fields(&self, other: &Self) -> ProtocolResult<Vec<&'static str>> {
        match (self, other) {
            (RecordPayload::Pacientes(a), RecordPayload::Pacientes(b)) => Ok(a.changed_fields(b)),
            (RecordPayload::Citas(a), RecordPayload::Citas(b)) => Ok(a.changed_fields(b)),
            (RecordPayload::Doctores(a), RecordPayload::Doctores(b)) => Ok(a.changed_fields(b)),
            _ => Err(ProtocolError::TableMismatch {
                expected: self.table().to_string(),
                actual: other.table().to_string(),
            }),
        }
    }

    /// Returns a copy of `self` with the named fields taken from `other`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TableMismatch`] if the payloads belong
    /// to different tables.
    pub fn merged_with(&self, other: &Self, take: &[&str]) -> ProtocolResult<Self> {
        match (self, other) {
            (RecordPayload::Pacientes(a), RecordPayload::Pacientes(b)) => {
                Ok(RecordPayload::Pacientes(a.merged_with(b, take)))
            }
            (RecordPayload::Citas(a), RecordPayload::Citas(b)) => {
                Ok(RecordPayload::Citas(a.merged_with(b, take)))
            }
            (RecordPayload::Doctores(a), RecordPayload::Doctores(b)) => {
                Ok(RecordPayload::Doctores(a.merged_with(b, take)))
            }
            _ => Err(ProtocolError::TableMismatch {
                expected: self.table().to_string(),
                actual: other.table().to_string(),
            }),
        }
    }
}
