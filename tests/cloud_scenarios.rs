//! End-to-end cloud facade scenarios over the in-memory provider

use assert_matches::assert_matches;
use ebs_cloud::provider::{collect_pages, DescribeRequest, Ec2Api, FakeEc2, Instance, Volume};
use ebs_cloud::util::GIB;
use ebs_cloud::{
    Cloud, DeviceManager, DiskOptions, Ec2Cloud, Error, ErrorKind, FakeCloud, OpContext, Outcome,
    SnapshotOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn ec2_cloud(fake: &Arc<FakeEc2>) -> Ec2Cloud {
    Ec2Cloud::with_transport("us-test-1", fake.clone(), Arc::new(DeviceManager::new()))
}

async fn disk_lifecycle(cloud: &dyn Cloud) -> String {
    let ctx = OpContext::new();

    let created = assert_ok!(
        cloud
            .create_disk(
                &ctx,
                "vol-a",
                DiskOptions::new(20 * GIB)
                    .with_volume_type("gp2")
                    .with_zone("us-test-1a"),
            )
            .await
    );

    let disk = assert_ok!(cloud.get_disk_by_name(&ctx, "vol-a", 20 * GIB).await);
    assert_eq!(disk.availability_zone, "us-test-1a");
    assert_eq!(disk.capacity_gib, 20);
    assert_eq!(disk.volume_id, created.volume_id);

    let first = assert_ok!(cloud.attach_disk(&ctx, &disk.volume_id, "i-1").await);
    let second = assert_ok!(cloud.attach_disk(&ctx, &disk.volume_id, "i-1").await);
    assert_eq!(first, second);

    assert_eq!(
        assert_ok!(cloud.detach_disk(&ctx, &disk.volume_id, "i-1").await),
        Outcome::Completed
    );
    assert_eq!(assert_ok!(cloud.get_disk_by_id(&ctx, &disk.volume_id).await), disk);

    assert_eq!(
        assert_ok!(cloud.delete_disk(&ctx, &disk.volume_id).await),
        Outcome::Completed
    );
    assert_eq!(
        assert_ok!(cloud.delete_disk(&ctx, &disk.volume_id).await),
        Outcome::NotFound
    );

    disk.volume_id
}

#[tokio::test(start_paused = true)]
async fn test_disk_lifecycle_over_provider() {
    let fake = Arc::new(FakeEc2::new().with_lag(1));
    fake.add_instance("i-1");
    let cloud = ec2_cloud(&fake);

    let volume_id = disk_lifecycle(&cloud).await;

    assert_eq!(fake.calls("AttachVolume"), 1);
    assert_eq!(fake.calls("DetachVolume"), 1);
    assert!(fake.volume(&volume_id).is_none());
}

#[tokio::test]
async fn test_disk_lifecycle_over_fake_cloud() {
    let cloud = FakeCloud::new();
    cloud.add_instance("i-1");

    disk_lifecycle(&cloud).await;
    assert_eq!(cloud.disk_count(), 0);
}

#[tokio::test]
async fn test_three_page_listing_is_concatenated_in_order() {
    let fake = Arc::new(FakeEc2::new().with_page_size(2));
    let ids: Vec<String> = (0..5)
        .map(|_| fake.insert_volume(Volume::default()))
        .collect();

    let volumes = assert_ok!(
        collect_pages(DescribeRequest::default(), |page| fake.describe_volumes(page)).await
    );

    let listed: Vec<String> = volumes.into_iter().filter_map(|v| v.volume_id).collect();
    assert_eq!(listed, ids);
    assert_eq!(fake.calls("DescribeVolumes"), 3);
}

#[tokio::test]
async fn test_name_lookup_drains_every_page() {
    let fake = Arc::new(FakeEc2::new().with_page_size(2));
    for _ in 0..5 {
        let mut volume = Volume {
            size_gib: Some(1),
            ..Default::default()
        };
        volume.tags.insert("CSIVolumeName".to_string(), "pvc-dup".to_string());
        fake.insert_volume(volume);
    }
    for _ in 0..5 {
        fake.insert_instance(Instance {
            instance_id: Some("i-dup".to_string()),
            block_device_mappings: Vec::new(),
        });
    }
    let cloud = ec2_cloud(&fake);
    let ctx = OpContext::new();

    assert_matches!(
        cloud.get_disk_by_name(&ctx, "pvc-dup", GIB).await,
        Err(Error::MultipleFound { count: 5, .. })
    );
    assert_matches!(
        cloud.instance_exists(&ctx, "i-dup").await,
        Err(Error::MultipleFound { count: 5, .. })
    );
    assert_eq!(fake.calls("DescribeInstances"), 3);
}

#[tokio::test]
async fn test_list_snapshots_page_size_bounds() {
    let fake = Arc::new(FakeEc2::new());
    let cloud = ec2_cloud(&fake);
    let ctx = OpContext::new();

    let volume_id = fake.insert_volume(Volume {
        size_gib: Some(2),
        state: Some("available".to_string()),
        ..Default::default()
    });
    for i in 0..6 {
        assert_ok!(
            cloud
                .create_snapshot(&ctx, &volume_id, SnapshotOptions::named(format!("snap-{}", i)))
                .await
        );
    }

    for max in 1..=4 {
        let err = assert_err!(cloud.list_snapshots(&ctx, None, max, None).await);
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    let all = assert_ok!(cloud.list_snapshots(&ctx, Some(volume_id.as_str()), 0, None).await);
    assert_eq!(all.snapshots.len(), 6);
    assert!(all.next_token.is_empty());

    let page = assert_ok!(cloud.list_snapshots(&ctx, None, 5, None).await);
    assert_eq!(page.snapshots.len(), 5);
    assert!(!page.next_token.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_stops_waiting() {
    let fake = Arc::new(FakeEc2::new().with_lag(100));
    let cloud = ec2_cloud(&fake);
    let ctx = OpContext::new().with_timeout(Duration::from_secs(10));

    let err = assert_err!(
        cloud
            .create_disk(&ctx, "slow", DiskOptions::new(GIB).with_zone("us-test-1a"))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    assert!(fake.calls("DescribeVolumes") <= 3);
}
