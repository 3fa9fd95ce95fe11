//! Static, ordered catalog of exported sections.
//!
//! Order matters: sheets appear in the workbook exactly in this order.
//! Every query takes the tenant id as `@P1`.

use super::SectionSpec;

pub const PATIENT_IMAGES: &str = "Patient Images";

pub static SECTIONS: &[SectionSpec] = &[
    SectionSpec {
        name: "Patients",
        query: "SELECT p.name, p.tax_id, p.national_id, p.postal_code, p.birth_date, p.email,
                       p.status, p.state, p.city, p.street, p.district, p.street_number,
                       p.phone1, p.phone2, p.mobile, p.created_at, p.sex, p.address_extra,
                       p.record_number, p.photo, p.notes, p.guardian_name, p.guardian_tax_id
                FROM patients p
                WHERE p.clinic_id = @P1",
        asset_field: None,
    },
    SectionSpec {
        name: "Patient Origins",
        query: "SELECT p.name, o.description
                FROM patients p
                JOIN patient_origins o ON p.origin_id = o.id
                WHERE p.clinic_id = @P1",
        asset_field: None,
    },
    SectionSpec {
        name: PATIENT_IMAGES,
        query: "SELECT c.legal_name AS clinic, p.name, i.photo
                FROM album_images i
                JOIN patient_albums a ON i.album_id = a.id
                JOIN patients p ON a.patient_id = p.id
                JOIN clinics c ON p.clinic_id = c.id
                WHERE p.clinic_id = @P1",
        asset_field: Some("photo"),
    },
    SectionSpec {
        name: "Appointments",
        query: "SELECT p.name AS patient, s.name AS professional, ap.scheduled_at, ap.duration,
                       ap.notes, sp.description AS specialty, sv.description AS procedure
                FROM appointments ap
                JOIN patients p ON ap.patient_id = p.id
                LEFT JOIN staff s ON ap.staff_id = s.id
                LEFT JOIN specialties sp ON ap.specialty_id = sp.id
                LEFT JOIN services sv ON ap.service_id = sv.id
                WHERE ap.clinic_id = @P1",
        asset_field: None,
    },
    SectionSpec {
        name: "Orthodontic Visits",
        query: "SELECT sv.description, r.total_amount, p.name AS patient, s.name AS professional,
                       vi.performed_at, vi.notes
                FROM visit_items vi
                JOIN staff s ON vi.staff_id = s.id
                JOIN visits v ON vi.visit_id = v.id
                JOIN patients p ON v.patient_id = p.id
                JOIN services sv ON v.service_id = sv.id
                JOIN receivables r ON v.receivable_id = r.id
                WHERE p.clinic_id = @P1",
        asset_field: None,
    },
    SectionSpec {
        name: "Visits",
        query: "SELECT sv.description, p.name AS patient, s.name AS professional,
                       vi.performed_at, vi.notes
                FROM visit_items vi
                JOIN staff s ON vi.staff_id = s.id
                JOIN visits v ON vi.visit_id = v.id
                JOIN patients p ON v.patient_id = p.id
                JOIN services sv ON vi.service_id = sv.id
                WHERE p.clinic_id = @P1 AND v.receivable_id IS NULL",
        asset_field: None,
    },
    SectionSpec {
        name: "Received Payments",
        query: "SELECT p.name AS patient, rp.paid_at, rp.amount, rp.method, rp.installment,
                       r.description
                FROM receivable_payments rp
                JOIN receivables r ON rp.receivable_id = r.id
                JOIN patients p ON r.patient_id = p.id
                WHERE p.clinic_id = @P1",
        asset_field: None,
    },
    SectionSpec {
        name: "Scheduled Entries",
        query: "SELECT p.name AS patient, fe.due_date, fe.amount, fe.installment, fe.status
                FROM receivable_schedule fe
                JOIN receivables r ON fe.receivable_id = r.id
                JOIN patients p ON r.patient_id = p.id
                WHERE p.clinic_id = @P1",
        asset_field: None,
    },
    SectionSpec {
        name: "Receivable Entries",
        query: "SELECT p.name AS patient, r.description, r.total_amount, fe.due_date,
                       fe.amount, fe.paid_amount, fe.paid_at, fe.status
                FROM receivable_schedule fe
                JOIN receivables r ON fe.receivable_id = r.id
                JOIN patients p ON r.patient_id = p.id
                WHERE p.clinic_id = @P1",
        asset_field: None,
    },
    SectionSpec {
        name: "Estimate Procedures",
        query: "SELECT e.id AS estimate, p.name AS patient, sv.description AS procedure,
                       ei.tooth, ei.surface, ei.amount, ei.discount, ei.status,
                       s.name AS professional, e.created_at
                FROM estimate_items ei
                JOIN estimates e ON ei.estimate_id = e.id
                JOIN patients p ON e.patient_id = p.id
                JOIN services sv ON ei.service_id = sv.id
                LEFT JOIN staff s ON e.staff_id = s.id
                WHERE p.clinic_id = @P1",
        asset_field: None,
    },
    SectionSpec {
        name: "Standalone and Ortho Procedures",
        query: "SELECT v.id AS visit, p.name AS patient, sv.description AS procedure,
                       v.kind, v.amount, v.created_at, s.name AS professional
                FROM visits v
                JOIN patients p ON v.patient_id = p.id
                JOIN services sv ON v.service_id = sv.id
                LEFT JOIN staff s ON v.staff_id = s.id
                WHERE p.clinic_id = @P1 AND v.kind IN ('standalone', 'ortho')",
        asset_field: None,
    },
    SectionSpec {
        name: "Estimates",
        query: "SELECT e.id, p.name AS patient, e.total_amount, e.status, e.created_at,
                       e.approved_at
                FROM estimates e
                JOIN patients p ON e.patient_id = p.id
                WHERE p.clinic_id = @P1",
        asset_field: None,
    },
    SectionSpec {
        name: "Orthodontics",
        query: "SELECT p.name AS patient, o.started_at, o.monthly_fee, o.installments,
                       o.status, o.notes
                FROM ortho_contracts o
                JOIN patients p ON o.patient_id = p.id
                WHERE p.clinic_id = @P1",
        asset_field: None,
    },
    SectionSpec {
        name: "Follow-ups",
        query: "SELECT p.name AS patient, f.due_date, f.reason, f.completed
                FROM follow_ups f
                JOIN patients p ON f.patient_id = p.id
                WHERE p.clinic_id = @P1",
        asset_field: None,
    },
    SectionSpec {
        name: "Paid Bills",
        query: "SELECT b.description, b.supplier, b.due_date, b.paid_at, b.amount,
                       b.paid_amount, b.category
                FROM payables b
                WHERE b.clinic_id = @P1 AND b.paid_at IS NOT NULL",
        asset_field: None,
    },
    SectionSpec {
        name: "Bills Payable",
        query: "SELECT b.description, b.supplier, b.due_date, b.amount, b.category
                FROM payables b
                WHERE b.clinic_id = @P1 AND b.paid_at IS NULL",
        asset_field: None,
    },
];
