mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use ciborium::Value as Cbor;
use common::*;
use coset::{iana, CborSerializable, CoseSign1Builder, HeaderBuilder};
use mdoc_presentment::{
    config::TrustStoreConfig,
    core::cbor,
    trust::{
        CompositeTrustManager, LocalTrustManager, MemoryStorageTable, TrustEntryKind, TrustError,
        TrustManager, TrustMetadata, TrustPoint, Vical, VicalTrustManager,
    },
};
use p256::ecdsa::{signature::Signer, Signature};
use rcgen::KeyUsagePurpose;
use x509_cert::{
    der::{oid::ObjectIdentifier, Decode, Encode},
    Certificate,
};

fn store(storage: &Arc<MemoryStorageTable>) -> LocalTrustManager {
    LocalTrustManager::new(
        TrustStoreConfig::new("issuers", "TrustedIssuers").with_partition("default"),
        storage.clone(),
    )
    .unwrap()
}

fn fresh_store() -> LocalTrustManager {
    store(&Arc::new(MemoryStorageTable::new("TrustedIssuers")))
}

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn now() -> DateTime<Utc> {
    at(2026, 6, 1)
}

fn subjects(chain: &[Certificate]) -> Vec<String> {
    chain
        .iter()
        .map(|c| c.tbs_certificate.subject.to_string())
        .collect()
}

fn names(trust_points: &[TrustPoint]) -> Vec<&str> {
    trust_points
        .iter()
        .map(|tp| tp.metadata().display_name.as_deref().unwrap_or_default())
        .collect()
}

fn signed_vical(signer: &TestCert, issuers: &[(&TestCert, &str)]) -> Vec<u8> {
    let certificate_infos = issuers
        .iter()
        .map(|(issuer, authority)| {
            cbor::text_map([
                ("certificate", Cbor::Bytes(issuer.der())),
                ("docType", Cbor::Array(vec![Cbor::Text(MDL.into())])),
                ("issuingAuthority", Cbor::Text(authority.to_string())),
            ])
        })
        .collect();
    let vical = cbor::text_map([
        ("version", Cbor::Text("1.0".into())),
        ("vicalProvider", Cbor::Text("Test VICAL Provider".into())),
        (
            "date",
            Cbor::Tag(0, Box::new(Cbor::Text("2025-03-01T00:00:00Z".into()))),
        ),
        ("vicalIssueID", Cbor::Integer(7.into())),
        ("certificateInfos", Cbor::Array(certificate_infos)),
    ]);

    let key = signer.signing_key();
    CoseSign1Builder::new()
        .protected(HeaderBuilder::new().algorithm(iana::Algorithm::ES256).build())
        .unprotected(HeaderBuilder::new().value(33, Cbor::Bytes(signer.der())).build())
        .payload(cbor::to_vec(&vical).unwrap())
        .create_signature(&[], |data| {
            let signature: Signature = key.sign(data);
            signature.to_bytes().to_vec()
        })
        .build()
        .to_vec()
        .unwrap()
}

// ---------------------------------------------------------------------------
// chain building
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chain_is_completed_from_the_store() {
    let (root, intermediate, leaf) = reader_chain();
    let trust = fresh_store();
    trust
        .add_x509_cert(&root.der(), TrustMetadata::named("root"))
        .await
        .unwrap();
    trust
        .add_x509_cert(&intermediate.der(), TrustMetadata::named("intermediate"))
        .await
        .unwrap();

    let result = trust.verify(&[leaf.der()], now()).await.unwrap();
    assert!(result.is_trusted, "{:?}", result.error);
    assert_eq!(
        subjects(result.trust_chain.as_deref().unwrap()),
        ["CN=Reader", "CN=Reader Intermediate", "CN=Reader Root"]
    );
    assert_eq!(names(&result.trust_points), ["intermediate", "root"]);
}

#[tokio::test]
async fn presented_intermediate_is_kept() {
    let (root, intermediate, leaf) = reader_chain();
    let trust = fresh_store();
    trust
        .add_x509_cert(&root.der(), TrustMetadata::named("root"))
        .await
        .unwrap();

    let result = trust
        .verify(&[leaf.der(), intermediate.der()], now())
        .await
        .unwrap();
    assert!(result.is_trusted, "{:?}", result.error);
    assert_eq!(
        subjects(result.trust_chain.as_deref().unwrap()),
        ["CN=Reader", "CN=Reader Intermediate", "CN=Reader Root"]
    );
    assert_eq!(names(&result.trust_points), ["root"]);

    // Building the same chain twice yields the same result.
    let again = trust
        .verify(&[leaf.der(), intermediate.der()], now())
        .await
        .unwrap();
    assert_eq!(again.trust_chain, result.trust_chain);
    assert_eq!(again.trust_points, result.trust_points);
}

#[tokio::test]
async fn validity_bounds_are_inclusive() {
    let root = CertSpec::ca("Root").build();
    let leaf = CertSpec::leaf("Leaf", &root)
        .valid((2024, 1, 1), (2025, 1, 1))
        .build();
    let trust = fresh_store();
    trust
        .add_x509_cert(&root.der(), TrustMetadata::default())
        .await
        .unwrap();
    let chain = [leaf.der()];
    let second = Duration::seconds(1);

    assert!(trust.verify(&chain, at(2024, 1, 1)).await.unwrap().is_trusted);
    assert!(trust.verify(&chain, at(2025, 1, 1)).await.unwrap().is_trusted);

    for instant in [at(2024, 1, 1) - second, at(2025, 1, 1) + second] {
        let result = trust.verify(&chain, instant).await.unwrap();
        assert!(!result.is_trusted);
        assert!(result.trust_chain.is_some());
        assert!(result.error.is_some());
    }
}

#[tokio::test]
async fn leaf_without_digital_signature_is_not_trusted() {
    let root = CertSpec::ca("Root").build();
    let leaf = CertSpec::leaf("Key Agreement", &root)
        .key_usages(vec![KeyUsagePurpose::KeyAgreement])
        .build();
    let trust = fresh_store();
    trust
        .add_x509_cert(&root.der(), TrustMetadata::default())
        .await
        .unwrap();

    let result = trust.verify(&[leaf.der()], now()).await.unwrap();
    assert!(!result.is_trusted);
    assert_eq!(result.trust_chain.as_ref().map(Vec::len), Some(2));
    let error = result.error.unwrap();
    assert!(format!("{error:#}").contains("digitalSignature"), "{error:#}");
}

#[tokio::test]
async fn lone_registered_certificate() {
    let lone = CertSpec::ca("Lone")
        .valid((2024, 1, 1), (2030, 1, 1))
        .without_authority_key_identifier()
        .build();
    let trust = fresh_store();
    trust
        .add_x509_cert(&lone.der(), TrustMetadata::named("lone"))
        .await
        .unwrap();

    let result = trust.verify(&[lone.der()], now()).await.unwrap();
    assert!(result.is_trusted, "{:?}", result.error);
    assert_eq!(names(&result.trust_points), ["lone"]);

    let expired = trust.verify(&[lone.der()], at(2031, 1, 1)).await.unwrap();
    assert!(!expired.is_trusted);
    assert!(expired.trust_chain.is_some());
}

#[tokio::test]
async fn unknown_chain_is_untrusted() {
    let (root, _, _) = reader_chain();
    let (_, other_intermediate, other_leaf) = reader_chain();
    let trust = fresh_store();
    trust
        .add_x509_cert(&root.der(), TrustMetadata::default())
        .await
        .unwrap();

    let result = trust
        .verify(&[other_leaf.der(), other_intermediate.der()], now())
        .await
        .unwrap();
    assert!(!result.is_trusted);
    assert!(result.trust_chain.is_none());
    assert!(result.trust_points.is_empty());
    assert!(result.error.is_some());
}

// ---------------------------------------------------------------------------
// local store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_certificate_is_rejected() {
    let root = CertSpec::ca("Root").build();
    let trust = fresh_store();
    let entry = trust
        .add_x509_cert(&root.der(), TrustMetadata::named("first"))
        .await
        .unwrap();
    assert!(matches!(entry.kind, TrustEntryKind::X509 { ref ski, .. } if *ski == entry.id));

    let err = trust
        .add_x509_cert(&root.der(), TrustMetadata::named("second"))
        .await
        .unwrap_err();
    assert!(matches!(err, TrustError::AlreadyExists(ref ski) if *ski == entry.id));
    assert_eq!(trust.entries().await.unwrap(), [entry]);
}

#[tokio::test]
async fn certificate_without_ski_is_rejected() {
    let root = CertSpec::ca("Root").build();
    let mut certificate = Certificate::from_der(&root.der()).unwrap();
    let ski = ObjectIdentifier::new_unwrap("2.5.29.14");
    if let Some(extensions) = certificate.tbs_certificate.extensions.as_mut() {
        extensions.retain(|extension| extension.extn_id != ski);
    }

    let trust = fresh_store();
    let err = trust
        .add_x509_cert(&certificate.to_der().unwrap(), TrustMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TrustError::MissingSubjectKeyIdentifier));
    assert!(trust.entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn entries_survive_a_restart() {
    let storage = Arc::new(MemoryStorageTable::new("TrustedIssuers"));
    let root = CertSpec::ca("Root").build();
    let vical_signer = CertSpec::ca("VICAL Signer").build();
    {
        let trust = store(&storage);
        trust
            .add_x509_cert(&root.der(), TrustMetadata::named("root"))
            .await
            .unwrap();
        trust
            .add_origin("https://verifier.example/start", TrustMetadata::named("verifier"))
            .await
            .unwrap();
        trust
            .add_vical(
                &signed_vical(&vical_signer, &[(&root, "Utopia DMV")]),
                TrustMetadata::default(),
            )
            .await
            .unwrap();
    }

    let trust = store(&storage);
    let entries = trust.entries().await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.windows(2).all(|w| w[0].time_added <= w[1].time_added));
    assert!(entries
        .iter()
        .any(|e| matches!(e.kind, TrustEntryKind::Vical { num_certificates: 1, .. })));
    assert!(
        trust
            .verify_origin("https://verifier.example")
            .await
            .unwrap()
            .is_trusted
    );
}

#[tokio::test]
async fn metadata_update_and_delete() {
    let root = CertSpec::ca("Root").build();
    let leaf = CertSpec::leaf("Leaf", &root).build();
    let trust = fresh_store();
    let entry = trust
        .add_x509_cert(&root.der(), TrustMetadata::named("before"))
        .await
        .unwrap();

    let updated = trust
        .update_metadata(
            &entry,
            TrustMetadata {
                display_name: Some("after".into()),
                test_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.id, entry.id);
    assert!(updated.time_added >= entry.time_added);

    let result = trust.verify(&[leaf.der()], now()).await.unwrap();
    assert_eq!(names(&result.trust_points), ["after"]);
    assert!(result.trust_points[0].metadata().test_only);

    // The stale entry no longer exists.
    assert!(matches!(
        trust.update_metadata(&entry, TrustMetadata::default()).await,
        Err(TrustError::InvalidArgument(_))
    ));
    assert!(!trust.delete_entry(&entry).await.unwrap());

    assert!(trust.delete_entry(&updated).await.unwrap());
    assert!(trust.entries().await.unwrap().is_empty());
    assert!(!trust.verify(&[leaf.der()], now()).await.unwrap().is_trusted);
}

#[tokio::test]
async fn origins() {
    let trust = fresh_store();
    trust
        .add_origin("https://Verifier.example:443/path?q=1", TrustMetadata::named("verifier"))
        .await
        .unwrap();

    let result = trust.verify_origin("https://verifier.example").await.unwrap();
    assert!(result.is_trusted);
    assert_eq!(result.trust_chain.as_ref().map(Vec::len), Some(0));
    assert!(matches!(
        &result.trust_points[0],
        TrustPoint::Origin { origin, .. } if origin == "https://verifier.example"
    ));

    assert!(!trust.verify_origin("https://verifier.example:8443").await.unwrap().is_trusted);
    assert!(matches!(
        trust.add_origin("data:text/plain,hi", TrustMetadata::default()).await,
        Err(TrustError::InvalidArgument(_))
    ));
}

// ---------------------------------------------------------------------------
// VICAL
// ---------------------------------------------------------------------------

#[tokio::test]
async fn vical_is_parsed_and_verified() {
    let signer = CertSpec::ca("VICAL Signer").build();
    let iaca = CertSpec::ca("Utopia IACA").build();
    let document_signer = CertSpec::leaf("Utopia DS", &iaca).build();
    let encoded = signed_vical(&signer, &[(&iaca, "Utopia DMV")]);

    let vical = Vical::parse(&encoded).unwrap();
    assert_eq!(vical.version, "1.0");
    assert_eq!(vical.provider, "Test VICAL Provider");
    assert_eq!(vical.date, at(2025, 3, 1));
    assert_eq!(vical.issue_id, Some(7));
    assert_eq!(vical.certificate_infos.len(), 1);
    assert_eq!(vical.certificate_infos[0].doc_types, [MDL]);
    assert_eq!(vical.verify_signature().unwrap(), [signer.der()]);

    let manager = VicalTrustManager::new("vical", &vical, &TrustMetadata::default());
    assert!(manager.is_vical_backed());
    let result = manager.verify(&[document_signer.der()], now()).await.unwrap();
    assert!(result.is_trusted, "{:?}", result.error);
    assert_eq!(names(&result.trust_points), ["Utopia DMV"]);
}

#[tokio::test]
async fn tampered_vical_fails_verification() {
    let signer = CertSpec::ca("VICAL Signer").build();
    let impostor = CertSpec::ca("Impostor").build();
    let iaca = CertSpec::ca("Utopia IACA").build();

    let mut sign1 = coset::CoseSign1::from_slice(&signed_vical(&signer, &[(&iaca, "Utopia DMV")])).unwrap();
    sign1.unprotected = HeaderBuilder::new().value(33, Cbor::Bytes(impostor.der())).build();
    let vical = Vical::parse(&sign1.to_vec().unwrap()).unwrap();
    assert!(vical.verify_signature().is_err());
}

#[tokio::test]
async fn duplicate_vical_is_rejected() {
    let signer = CertSpec::ca("VICAL Signer").build();
    let iaca = CertSpec::ca("Utopia IACA").build();
    let encoded = signed_vical(&signer, &[(&iaca, "Utopia DMV")]);

    let trust = fresh_store();
    let entry = trust.add_vical(&encoded, TrustMetadata::default()).await.unwrap();
    let err = trust.add_vical(&encoded, TrustMetadata::default()).await.unwrap_err();
    assert!(matches!(err, TrustError::AlreadyExists(ref id) if *id == entry.id));
    assert_eq!(trust.entries().await.unwrap().len(), 1);
}

#[tokio::test]
async fn vicals_are_consulted_first() {
    let signer = CertSpec::ca("VICAL Signer").build();
    let iaca = CertSpec::ca("Utopia IACA").build();
    let document_signer = CertSpec::leaf("Utopia DS", &iaca).build();
    let encoded = signed_vical(&signer, &[(&iaca, "Utopia DMV")]);

    // Within one store.
    let trust = fresh_store();
    trust
        .add_x509_cert(&iaca.der(), TrustMetadata::named("direct"))
        .await
        .unwrap();
    trust
        .add_vical(&encoded, TrustMetadata::named("from VICAL"))
        .await
        .unwrap();
    let result = trust.verify(&[document_signer.der()], now()).await.unwrap();
    assert!(result.is_trusted);
    assert_eq!(names(&result.trust_points), ["from VICAL"]);
    assert_eq!(names(&trust.trust_points().await.unwrap()), ["from VICAL", "direct"]);

    // Across managers.
    let direct = Arc::new(fresh_store());
    direct
        .add_x509_cert(&iaca.der(), TrustMetadata::named("direct"))
        .await
        .unwrap();
    let vical = Arc::new(VicalTrustManager::new(
        "vical",
        &Vical::parse(&encoded).unwrap(),
        &TrustMetadata::default(),
    ));
    let composite = CompositeTrustManager::new(
        "all",
        vec![direct as Arc<dyn TrustManager>, vical as Arc<dyn TrustManager>],
    );
    assert!(composite.managers()[0].is_vical_backed());

    let result = composite.verify(&[document_signer.der()], now()).await.unwrap();
    assert!(result.is_trusted);
    assert_eq!(result.trust_points[0].trust_manager_id(), "vical");
    assert_eq!(names(&result.trust_points), ["Utopia DMV"]);
}

#[tokio::test]
async fn composite_falls_back_to_a_partial_chain() {
    let root = CertSpec::ca("Root").build();
    let expired = CertSpec::leaf("Expired", &root)
        .valid((2020, 1, 1), (2021, 1, 1))
        .build();
    let unrelated = Arc::new(fresh_store());
    let holder_of_root = Arc::new(fresh_store());
    holder_of_root
        .add_x509_cert(&root.der(), TrustMetadata::named("root"))
        .await
        .unwrap();

    let composite = CompositeTrustManager::new(
        "all",
        vec![unrelated as Arc<dyn TrustManager>, holder_of_root as Arc<dyn TrustManager>],
    );
    let result = composite.verify(&[expired.der()], now()).await.unwrap();
    assert!(!result.is_trusted);
    assert_eq!(result.trust_chain.as_ref().map(Vec::len), Some(2));
    assert_eq!(names(&result.trust_points), ["root"]);
}

#[tokio::test]
async fn composite_trusts_an_origin_behind_a_vical() {
    let signer = CertSpec::ca("VICAL Signer").build();
    let iaca = CertSpec::ca("Utopia IACA").build();
    let vical = Arc::new(VicalTrustManager::new(
        "vical",
        &Vical::parse(&signed_vical(&signer, &[(&iaca, "Utopia DMV")])).unwrap(),
        &TrustMetadata::default(),
    ));
    let websites = Arc::new(fresh_store());
    websites
        .add_origin("https://verifier.example", TrustMetadata::named("verifier"))
        .await
        .unwrap();

    let composite = CompositeTrustManager::new(
        "all",
        vec![websites as Arc<dyn TrustManager>, vical as Arc<dyn TrustManager>],
    );
    let result = composite.verify_origin("https://verifier.example").await.unwrap();
    assert!(result.is_trusted);
    assert!(result.trust_chain.is_some());
    assert_eq!(names(&result.trust_points), ["verifier"]);

    let result = composite.verify_origin("https://other.example").await.unwrap();
    assert!(!result.is_trusted);
    assert!(result.trust_chain.is_none());
}
