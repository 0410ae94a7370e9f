//! End-to-end behavior of the access-control pipeline on synthesized frames.
//!
//! Faces are flat two-tone textures pasted onto a uniform background. The
//! locator used here reports the bounding box of everything that is not
//! background, so detection is exact and the tests exercise decoding,
//! normalization, training and the decision rule.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use facegate_core::{
    AccessControl, AccessError, ClassifierLifecycle, FaceLocator, FaceRegion, Gallery,
    GalleryError, ImageInput, LbphTrainer, MemberId, MemoryGallery, PipelineError,
    Registration, RejectReason, VerificationEngine, VerifyPolicy,
};
use image::imageops;
use image::{GrayImage, Rgb, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const BACKGROUND: u8 = 128;

#[derive(Clone, Copy)]
enum Pattern {
    Vertical,
    Horizontal,
    Checker,
}

fn face(pattern: Pattern, size: u32) -> RgbImage {
    RgbImage::from_fn(size, size, |x, y| {
        let dark = match pattern {
            Pattern::Vertical => (x / 2) % 2 == 0,
            Pattern::Horizontal => (y / 2) % 2 == 0,
            Pattern::Checker => ((x / 3) + (y / 3)) % 2 == 0,
        };
        let v = if dark { 40 } else { 210 };
        Rgb([v, v, v])
    })
}

fn frame(width: u32, height: u32, faces: &[(&RgbImage, i64, i64)]) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(width, height, Rgb([BACKGROUND; 3]));
    for (img, x, y) in faces {
        imageops::replace(&mut canvas, *img, *x, *y);
    }
    canvas
}

fn png(img: &RgbImage) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

fn input(img: &RgbImage) -> ImageInput {
    ImageInput::Encoded(png(img))
}

/// A frame holding a single face of `pattern` at `(x, y)`.
fn portrait(pattern: Pattern, size: u32, x: i64, y: i64) -> ImageInput {
    input(&frame(320, 320, &[(&face(pattern, size), x, y)]))
}

/// Bounding box of all non-background pixels.
fn mask_locator(luma: &GrayImage) -> Vec<FaceRegion> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, p) in luma.enumerate_pixels() {
        if p.0[0] == BACKGROUND {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    bounds
        .map(|(x0, y0, x1, y1)| vec![FaceRegion::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1)])
        .unwrap_or_default()
}

fn registration(first: &str, email: &str) -> Registration {
    Registration {
        first_name: first.into(),
        last_name: "Guest".into(),
        email: email.into(),
        phone: None,
    }
}

fn service_with(gallery: Arc<dyn Gallery>, locator: Arc<dyn FaceLocator>, threshold: f64) -> AccessControl {
    AccessControl::new(gallery, locator, LbphTrainer::default(), VerifyPolicy { threshold }).unwrap()
}

fn service(gallery: Arc<MemoryGallery>) -> AccessControl {
    service_with(gallery, Arc::new(mask_locator), 70.0)
}

#[test]
fn enroll_then_verify_same_face_accepts() {
    let access = service(Arc::new(MemoryGallery::new()));
    let id = access
        .enroll_member(registration("Ada", "ada@example.com"), portrait(Pattern::Vertical, 200, 50, 50))
        .unwrap();

    let result = access.verify(portrait(Pattern::Vertical, 200, 90, 20)).unwrap();
    assert!(result.is_accepted(), "{result:?}");
    assert_eq!(result.member_id, Some(id));
    assert_eq!(result.member_name.as_deref(), Some("Ada Guest"));
    assert!(result.distance.unwrap() < 1e-9);
}

#[test]
fn verify_accepts_data_url_frames() {
    let access = service(Arc::new(MemoryGallery::new()));
    let id = access
        .enroll_member(registration("Ada", "ada@example.com"), portrait(Pattern::Checker, 200, 10, 10))
        .unwrap();

    let bytes = png(&frame(320, 320, &[(&face(Pattern::Checker, 200), 60, 60)]));
    let url = format!("data:image/png;base64,{}", STANDARD.encode(bytes));
    let result = access.verify(ImageInput::DataUrl(url)).unwrap();
    assert_eq!(result.member_id, Some(id));
}

#[test]
fn faceless_frame_rejected_without_panic() {
    let access = service(Arc::new(MemoryGallery::new()));
    let empty = input(&frame(320, 320, &[]));

    let err = access
        .enroll_member(registration("Ada", "ada@example.com"), empty.clone())
        .unwrap_err();
    assert!(matches!(err, AccessError::Pipeline(PipelineError::NoFaceDetected)));
    assert_eq!(access.list_members().unwrap().len(), 0);

    access
        .enroll_member(registration("Bob", "bob@example.com"), portrait(Pattern::Vertical, 200, 0, 0))
        .unwrap();
    let result = access.verify(empty).unwrap();
    assert!(!result.is_accepted());
    assert_eq!(result.reason, Some(RejectReason::NoFaceDetected));
    assert_eq!(result.distance, None);
}

#[test]
fn undecodable_image_is_rejection_on_verify_and_error_on_enroll() {
    let access = service(Arc::new(MemoryGallery::new()));
    let garbage = ImageInput::Encoded(b"not a picture".to_vec());
    let err = access
        .enroll_member(registration("Ada", "ada@example.com"), garbage.clone())
        .unwrap_err();
    assert!(matches!(err, AccessError::Pipeline(PipelineError::Decode(_))));

    access
        .enroll_member(registration("Ada", "ada@example.com"), portrait(Pattern::Vertical, 200, 0, 0))
        .unwrap();
    let result = access.verify(garbage).unwrap();
    assert!(matches!(result.reason, Some(RejectReason::Undecodable { .. })));
}

#[test]
fn empty_gallery_rejects_before_detection() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let locator = move |luma: &GrayImage| {
        counter.fetch_add(1, Ordering::SeqCst);
        mask_locator(luma)
    };
    let access = service_with(Arc::new(MemoryGallery::new()), Arc::new(locator), 70.0);

    let result = access.verify(portrait(Pattern::Vertical, 200, 0, 0)).unwrap();
    assert_eq!(result.reason, Some(RejectReason::GalleryEmpty));
    assert_eq!(result.distance, None);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Undecodable input is not even looked at.
    let result = access.verify(ImageInput::Encoded(Vec::new())).unwrap();
    assert_eq!(result.reason, Some(RejectReason::GalleryEmpty));
}

#[test]
fn deleted_member_never_matched() {
    let access = service(Arc::new(MemoryGallery::new()));
    let ada = access
        .enroll_member(registration("Ada", "ada@example.com"), portrait(Pattern::Vertical, 200, 0, 0))
        .unwrap();
    let bob = access
        .enroll_member(registration("Bob", "bob@example.com"), portrait(Pattern::Horizontal, 200, 0, 0))
        .unwrap();
    assert_eq!(access.verify(portrait(Pattern::Vertical, 200, 40, 40)).unwrap().member_id, Some(ada));

    access.delete_member(ada).unwrap();
    let result = access.verify(portrait(Pattern::Vertical, 200, 40, 40)).unwrap();
    assert_ne!(result.member_id, Some(ada));
    assert!(!result.is_accepted());
    assert_eq!(result.reason, Some(RejectReason::NoMatch));

    access.delete_member(bob).unwrap();
    let result = access.verify(portrait(Pattern::Horizontal, 200, 0, 0)).unwrap();
    assert_eq!(result.reason, Some(RejectReason::GalleryEmpty));
}

#[test]
fn delete_unknown_member_is_not_found_and_keeps_model() {
    let access = service(Arc::new(MemoryGallery::new()));
    access
        .enroll_member(registration("Ada", "ada@example.com"), portrait(Pattern::Vertical, 200, 0, 0))
        .unwrap();
    let before = access.status().unwrap().model_generation;

    let err = access.delete_member(MemberId(999)).unwrap_err();
    assert!(matches!(err, AccessError::Gallery(GalleryError::NotFound(MemberId(999)))));
    assert_eq!(access.status().unwrap().model_generation, before);
}

#[test]
fn member_missing_from_gallery_is_silently_rejected() {
    let gallery = Arc::new(MemoryGallery::new());
    let engine = VerificationEngine::new(Arc::new(mask_locator), VerifyPolicy::default());
    let (template, _) = engine.enroll(portrait(Pattern::Checker, 200, 0, 0)).unwrap();

    // The model knows a label the gallery has never stored.
    let lifecycle = ClassifierLifecycle::new(LbphTrainer::default());
    let snapshot = lifecycle.rebuild(vec![(MemberId(42), template)]);
    let result = engine
        .verify(portrait(Pattern::Checker, 200, 5, 5), &snapshot, gallery.as_ref())
        .unwrap();
    assert!(!result.is_accepted());
    assert_eq!(result.member_id, None);
    assert_eq!(result.reason, Some(RejectReason::MemberRemoved));
    assert!(result.distance.unwrap() < 1e-9);
}

#[test]
fn rebuild_without_change_gives_identical_distances() {
    let gallery = Arc::new(MemoryGallery::new());
    let access = service(Arc::clone(&gallery));
    access
        .enroll_member(registration("Ada", "ada@example.com"), portrait(Pattern::Vertical, 200, 0, 0))
        .unwrap();
    access
        .enroll_member(registration("Bob", "bob@example.com"), portrait(Pattern::Checker, 200, 0, 0))
        .unwrap();

    let lifecycle = ClassifierLifecycle::new(LbphTrainer::default());
    let engine = VerificationEngine::new(Arc::new(mask_locator), VerifyPolicy::default());
    let probe = || portrait(Pattern::Vertical, 150, 30, 30);

    let first = lifecycle.refresh(gallery.as_ref()).unwrap();
    let a = engine.verify(probe(), &first, gallery.as_ref()).unwrap();
    let second = lifecycle.refresh(gallery.as_ref()).unwrap();
    let b = engine.verify(probe(), &second, gallery.as_ref()).unwrap();

    assert_ne!(first.generation(), second.generation());
    assert_eq!(a.distance.unwrap().to_bits(), b.distance.unwrap().to_bits());
}

#[test]
fn largest_of_several_faces_is_enrolled() {
    let small = FaceRegion::new(20, 20, 120, 120);
    let large = FaceRegion::new(300, 100, 200, 200);
    let group = frame(
        640,
        360,
        &[
            (&face(Pattern::Horizontal, 120), 20, 20),
            (&face(Pattern::Vertical, 200), 300, 100),
        ],
    );
    let locator = move |luma: &GrayImage| {
        if luma.dimensions() == (640, 360) {
            vec![small, large]
        } else {
            mask_locator(luma)
        }
    };
    let access = service_with(Arc::new(MemoryGallery::new()), Arc::new(locator), 70.0);
    let id = access
        .enroll_member(registration("Ada", "ada@example.com"), input(&group))
        .unwrap();

    let large_crop = imageops::crop_imm(&group, 300, 100, 200, 200).to_image();
    let result = access.verify(input(&frame(320, 320, &[(&large_crop, 60, 60)]))).unwrap();
    assert_eq!(result.member_id, Some(id));

    let small_crop = imageops::crop_imm(&group, 20, 20, 120, 120).to_image();
    let result = access.verify(input(&frame(320, 320, &[(&small_crop, 60, 60)]))).unwrap();
    assert!(!result.is_accepted(), "{result:?}");
    assert_eq!(result.reason, Some(RejectReason::NoMatch));
}

#[test]
fn distance_equal_to_threshold_is_rejected() {
    let gallery = Arc::new(MemoryGallery::new());
    let access = service(Arc::clone(&gallery));
    access
        .enroll_member(registration("Ada", "ada@example.com"), portrait(Pattern::Vertical, 200, 0, 0))
        .unwrap();
    let probe = || portrait(Pattern::Vertical, 170, 10, 10);
    let distance = access.verify(probe()).unwrap().distance.unwrap();

    // Same gallery, retrained at startup: the probe lands on exactly the threshold.
    let at = service_with(gallery.clone(), Arc::new(mask_locator), distance);
    let result = at.verify(probe()).unwrap();
    assert_eq!(result.distance.unwrap().to_bits(), distance.to_bits());
    assert!(!result.is_accepted());
    assert_eq!(result.reason, Some(RejectReason::NoMatch));

    let above = service_with(gallery, Arc::new(mask_locator), f64::from_bits(distance.to_bits() + 1));
    assert!(above.verify(probe()).unwrap().is_accepted());
}

#[test]
fn duplicate_email_rejected_without_retraining() {
    let access = service(Arc::new(MemoryGallery::new()));
    access
        .enroll_member(registration("Ada", "ada@example.com"), portrait(Pattern::Vertical, 200, 0, 0))
        .unwrap();
    let generation = access.status().unwrap().model_generation;

    let err = access
        .enroll_member(registration("Eve", " ADA@example.com "), portrait(Pattern::Checker, 200, 0, 0))
        .unwrap_err();
    assert!(matches!(err, AccessError::Gallery(GalleryError::DuplicateIdentity { .. })));
    assert!(err.is_rejection());
    assert_eq!(access.status().unwrap().model_generation, generation);
    assert_eq!(access.list_members().unwrap().len(), 1);
}

#[test]
fn registration_is_sanitized_and_validated() {
    let access = service(Arc::new(MemoryGallery::new()));
    let err = access
        .enroll_member(registration("   ", "x@example.com"), portrait(Pattern::Vertical, 200, 0, 0))
        .unwrap_err();
    assert!(matches!(err, AccessError::InvalidRegistration(_)));

    let reg = Registration {
        first_name: "  Mary   Ann ".into(),
        last_name: " Smith".into(),
        email: " mary@example.com ".into(),
        phone: Some("   ".into()),
    };
    access.enroll_member(reg, portrait(Pattern::Vertical, 200, 0, 0)).unwrap();
    let members = access.list_members().unwrap();
    assert_eq!(members[0].first_name, "Mary Ann");
    assert_eq!(members[0].last_name, "Smith");
    assert_eq!(members[0].email, "mary@example.com");
    assert_eq!(members[0].phone, None);
    assert!(members[0].has_photo);
}

#[test]
fn member_photo_is_jpeg() {
    let access = service(Arc::new(MemoryGallery::new()));
    let id = access
        .enroll_member(registration("Ada", "ada@example.com"), portrait(Pattern::Vertical, 200, 0, 0))
        .unwrap();
    let jpeg = access.member_photo(id).unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (200, 200));

    assert!(matches!(
        access.member_photo(MemberId(77)),
        Err(AccessError::Gallery(GalleryError::NotFound(_)))
    ));
}

#[test]
fn restarted_service_trains_from_gallery() {
    let gallery = Arc::new(MemoryGallery::new());
    let id = service(Arc::clone(&gallery))
        .enroll_member(registration("Ada", "ada@example.com"), portrait(Pattern::Checker, 200, 0, 0))
        .unwrap();

    let restarted = service(gallery);
    let status = restarted.status().unwrap();
    assert!(status.trained);
    assert_eq!(status.members, 1);
    assert_eq!(status.threshold, 70.0);
    assert_eq!(restarted.verify(portrait(Pattern::Checker, 200, 0, 0)).unwrap().member_id, Some(id));
}
