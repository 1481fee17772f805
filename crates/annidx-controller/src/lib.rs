pub mod controller;
pub mod param_blob;
pub mod ranker;

pub use controller::{Index, Neighbor};
pub use param_blob::ParamBlob;
pub use ranker::RelevanceRanker;

#[cfg(test)]
mod tests {
    use annidx_core::{ConfigSnapshot, DescriptorRecord, Error, Uid};

    use super::*;

    fn snapshot(factory_string: &str) -> ConfigSnapshot {
        ConfigSnapshot {
            factory_string: factory_string.to_string(),
            ivf_nprobe: 1,
            read_only: false,
            use_gpu: false,
            gpu_id: None,
            random_seed: Some(7),
        }
    }

    /// Five basis vectors in 5 dimensions are each distance 1.0 from the
    /// origin; distance 0.0 from themselves.
    #[test]
    fn basis_vectors_report_expected_distances() {
        let index = Index::ephemeral(snapshot("IDMap,Flat")).unwrap();
        let mut descriptors = Vec::new();
        for i in 0..5 {
            let mut v = vec![0.0f32; 5];
            v[i] = 1.0;
            descriptors.push(DescriptorRecord::new(i as u64, v));
        }
        index.build(descriptors).unwrap();

        let origin = vec![0.0f32; 5];
        let hits = index.nn(&origin, 5).unwrap();
        for hit in &hits {
            assert!((hit.distance - 1.0).abs() < 1e-6);
        }

        let mut basis0 = vec![0.0f32; 5];
        basis0[0] = 1.0;
        let hits = index.nn(&basis0, 1).unwrap();
        assert_eq!(hits[0].record.uid, Uid::from(0u64));
        assert!(hits[0].distance < 1e-6);
    }

    /// Points on the line v_j = (j, 2j) come back in ascending distance
    /// order from the origin.
    #[test]
    fn line_points_come_back_in_ascending_order() {
        let index = Index::ephemeral(snapshot("IDMap,Flat")).unwrap();
        let descriptors: Vec<_> = (0..20u64)
            .map(|j| DescriptorRecord::new(j, vec![j as f32, 2.0 * j as f32]))
            .collect();
        index.build(descriptors).unwrap();

        let hits = index.nn(&[0.0, 0.0], 20).unwrap();
        let order: Vec<u64> = hits
            .iter()
            .map(|h| match h.record.uid {
                Uid::Int(n) => n,
                Uid::Str(_) => unreachable!(),
            })
            .collect();
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(order, sorted);
    }

    /// Build with 100 descriptors, update with 10 new ones -> count 110.
    #[test]
    fn build_then_update_accumulates_count() {
        let index = Index::ephemeral(snapshot("IDMap,Flat")).unwrap();
        let initial: Vec<_> = (0..100u64)
            .map(|i| DescriptorRecord::new(i, vec![i as f32, 0.0]))
            .collect();
        index.build(initial).unwrap();
        assert_eq!(index.count(), 100);

        let more: Vec<_> = (100..110u64)
            .map(|i| DescriptorRecord::new(i, vec![i as f32, 0.0]))
            .collect();
        index.update(more).unwrap();
        assert_eq!(index.count(), 110);
    }

    /// Remove uids 10 and 98, then update 10 more: count 108, and the freed
    /// internal indices are never reused (`next_index` keeps climbing).
    #[test]
    fn remove_then_update_never_reuses_indices() {
        let index = Index::ephemeral(snapshot("IDMap,Flat")).unwrap();
        let initial: Vec<_> = (0..100u64)
            .map(|i| DescriptorRecord::new(i, vec![i as f32, 0.0]))
            .collect();
        index.build(initial).unwrap();

        index.remove(&[Uid::from(10u64), Uid::from(98u64)]).unwrap();
        assert_eq!(index.count(), 98);

        let more: Vec<_> = (100..110u64)
            .map(|i| DescriptorRecord::new(i, vec![i as f32, 0.0]))
            .collect();
        index.update(more).unwrap();
        assert_eq!(index.count(), 108);
        assert_eq!(index.next_index(), 110);
    }

    /// An index persisted to file-backed stores survives being dropped and
    /// reopened from the same paths.
    #[test]
    fn persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let stores = || {
            (
                Box::new(annidx_store::FileByteStore::new(dir.path().join("ds.bin")))
                    as Box<dyn annidx_store::ByteStore>,
                Box::new(annidx_store::FileByteStore::new(dir.path().join("bm.bin")))
                    as Box<dyn annidx_store::ByteStore>,
                Box::new(annidx_store::FileByteStore::new(dir.path().join("engine.bin")))
                    as Box<dyn annidx_store::ByteStore>,
                Box::new(annidx_store::FileByteStore::new(dir.path().join("param.bin")))
                    as Box<dyn annidx_store::ByteStore>,
            )
        };

        {
            let (ds, bm, engine, param) = stores();
            let index = Index::open(snapshot("IDMap,Flat"), ds, bm, engine, param).unwrap();
            let descriptors: Vec<_> = (0..10u64)
                .map(|i| DescriptorRecord::new(i, vec![i as f32, -(i as f32)]))
                .collect();
            index.build(descriptors).unwrap();
        }

        let (ds, bm, engine, param) = stores();
        let reopened = Index::open(snapshot("IDMap,Flat"), ds, bm, engine, param).unwrap();
        assert_eq!(reopened.count(), 10);
        let hits = reopened.nn(&[0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].record.uid, Uid::from(0u64));
    }

    /// Removing from an empty index names the first uid that doesn't exist.
    #[test]
    fn remove_on_empty_index_names_first_offender() {
        let index = Index::ephemeral(snapshot("IDMap,Flat")).unwrap();
        let err = index.remove(&[Uid::from(1u64), Uid::from(2u64)]).unwrap_err();
        assert!(matches!(err, Error::UidNotFound(Uid::Int(1))));
    }

    #[test]
    fn mutators_reject_read_only_index() {
        let mut snap = snapshot("IDMap,Flat");
        snap.read_only = true;
        let index = Index::ephemeral(snap).unwrap();
        let err = index
            .build(vec![DescriptorRecord::new(1u64, vec![1.0])])
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly));
    }

    #[test]
    fn update_on_known_uid_is_a_silent_no_op() {
        let index = Index::ephemeral(snapshot("IDMap,Flat")).unwrap();
        index
            .build(vec![DescriptorRecord::new(1u64, vec![1.0, 0.0])])
            .unwrap();
        index
            .update(vec![DescriptorRecord::new(1u64, vec![99.0, 99.0])])
            .unwrap();
        assert_eq!(index.count(), 1);
        // the original vector is untouched: update never replaces a known uid
        let hits = index.nn(&[1.0, 0.0], 1).unwrap();
        assert!(hits[0].distance < 1e-6);
    }

    #[test]
    fn hnsw_pipeline_rebuilds_from_descriptor_store_on_remove() {
        let index = Index::ephemeral(snapshot("HNSW16")).unwrap();
        let descriptors: Vec<_> = (0..30u64)
            .map(|i| DescriptorRecord::new(i, vec![i as f32, 0.0]))
            .collect();
        index.build(descriptors).unwrap();
        index.remove(&[Uid::from(5u64)]).unwrap();
        assert_eq!(index.count(), 29);
        let hits = index.nn(&[5.0, 0.0], 1).unwrap();
        assert_ne!(hits[0].record.uid, Uid::from(5u64));
    }

    /// Removing an empty uid slice is a no-op, not an error.
    #[test]
    fn remove_on_empty_slice_is_a_no_op() {
        let index = Index::ephemeral(snapshot("IDMap,Flat")).unwrap();
        index
            .build(vec![DescriptorRecord::new(1u64, vec![1.0, 0.0])])
            .unwrap();
        index.remove(&[]).unwrap();
        assert_eq!(index.count(), 1);
    }

    /// Two indices cannot pin the same accelerator id at once; the second
    /// open fails with `ResourceBusy` while the first is still live.
    #[test]
    fn conflicting_gpu_id_is_rejected_as_resource_busy() {
        let mut snap = snapshot("IDMap,Flat");
        snap.use_gpu = true;
        snap.gpu_id = Some(3);
        let first = Index::ephemeral(snap.clone()).unwrap();

        let err = Index::ephemeral(snap).unwrap_err();
        assert!(matches!(err, Error::ResourceBusy(_)));

        drop(first);
    }

    /// Dropping the index that holds a pinned accelerator id frees it for
    /// the next index to pin.
    #[test]
    fn dropping_index_frees_its_pinned_gpu_id() {
        let mut snap = snapshot("IDMap,Flat");
        snap.use_gpu = true;
        snap.gpu_id = Some(4);
        let first = Index::ephemeral(snap.clone()).unwrap();
        drop(first);

        let second = Index::ephemeral(snap).unwrap();
        drop(second);
    }
}
