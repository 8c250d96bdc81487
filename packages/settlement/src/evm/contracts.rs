//! FAssets, Flare Data Connector and ERC-4626 ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings. Only the
//! functions and events the settlement flows touch are declared.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// FDC Payment attestation type
    #[sol(all_derives)]
    library IPayment {
        struct RequestBody {
            bytes32 transactionId;
            uint256 inUtxo;
            uint256 utxo;
        }

        struct ResponseBody {
            uint64 blockNumber;
            uint64 blockTimestamp;
            bytes32 sourceAddressHash;
            bytes32 sourceAddressesRoot;
            bytes32 receivingAddressHash;
            bytes32 intendedReceivingAddressHash;
            int256 spentAmount;
            int256 intendedSpentAmount;
            int256 receivedAmount;
            int256 intendedReceivedAmount;
            bytes32 standardPaymentReference;
            bool oneToOne;
            uint8 status;
        }

        struct Response {
            bytes32 attestationType;
            bytes32 sourceId;
            uint64 votingRound;
            uint64 lowestUsedTimestamp;
            RequestBody requestBody;
            ResponseBody responseBody;
        }

        struct Proof {
            bytes32[] merkleProof;
            Response data;
        }
    }

    /// FAssets AssetManager (FXRP)
    #[sol(rpc)]
    contract IAssetManager {
        struct AvailableAgentInfo {
            address agentVault;
            address ownerManagementAddress;
            uint256 feeBIPS;
            uint256 mintingVaultCollateralRatioBIPS;
            uint256 mintingPoolCollateralRatioBIPS;
            uint256 freeCollateralLots;
            uint8 status;
        }

        struct CollateralReservationInfo {
            uint64 collateralReservationId;
            address agentVault;
            address minter;
            string paymentAddress;
            bytes32 paymentReference;
            uint256 valueUBA;
            uint256 mintingFeeUBA;
            uint256 reservationFeeNatWei;
            uint64 lastUnderlyingBlock;
            uint64 lastUnderlyingTimestamp;
            address executor;
            uint256 executorFeeNatWei;
            uint8 status;
        }

        /// Lot size in UBA (drops for FXRP)
        function lotSize() external view returns (uint256 _lotSizeUBA);

        function getAvailableAgentsDetailedList(uint256 _start, uint256 _end)
            external view returns (AvailableAgentInfo[] memory _agents, uint256 _totalLength);

        function collateralReservationFee(uint256 _lots) external view returns (uint256 _reservationFeeNATWei);

        function reserveCollateral(
            address _agentVault,
            uint256 _lots,
            uint256 _maxMintingFeeBIPS,
            address payable _executor
        ) external payable;

        function collateralReservationInfo(uint256 _collateralReservationId)
            external view returns (CollateralReservationInfo memory);

        function executeMinting(IPayment.Proof calldata _payment, uint256 _collateralReservationId) external;

        function redeem(uint256 _lots, string memory _redeemerUnderlyingAddressString, address payable _executor)
            external payable returns (uint256 _redeemedAmountUBA);

        function confirmRedemptionPayment(IPayment.Proof calldata _payment, uint256 _redemptionRequestId) external;

        event CollateralReserved(
            address indexed agentVault,
            address indexed minter,
            uint256 indexed collateralReservationId,
            uint256 valueUBA,
            uint256 feeUBA,
            uint256 firstUnderlyingBlock,
            uint256 lastUnderlyingBlock,
            uint256 lastUnderlyingTimestamp,
            string paymentAddress,
            bytes32 paymentReference,
            address executor,
            uint256 executorFeeNatWei
        );

        event MintingExecuted(
            address indexed agentVault,
            uint256 indexed collateralReservationId,
            uint256 mintedAmountUBA,
            uint256 agentFeeUBA,
            uint256 poolFeeUBA
        );

        event RedemptionRequested(
            address indexed agentVault,
            address indexed redeemer,
            uint256 indexed requestId,
            string paymentAddress,
            uint256 valueUBA,
            uint256 feeUBA,
            uint256 firstUnderlyingBlock,
            uint256 lastUnderlyingBlock,
            uint256 lastUnderlyingTimestamp,
            bytes32 paymentReference,
            address executor,
            uint256 executorFeeNatWei
        );
    }

    /// FDC hub accepting attestation requests
    #[sol(rpc)]
    contract IFdcHub {
        function requestAttestation(bytes calldata _data) external payable;

        event AttestationRequest(bytes data, uint256 fee);
    }

    #[sol(rpc)]
    contract IFdcRequestFeeConfigurations {
        function getRequestFee(bytes calldata _data) external view returns (uint256);
    }

    /// ERC-4626 tokenized vault
    #[sol(rpc)]
    contract IERC4626 {
        function asset() external view returns (address);
        function previewRedeem(uint256 shares) external view returns (uint256);
        function deposit(uint256 assets, address receiver) external returns (uint256 shares);
        function redeem(uint256 shares, address receiver, address owner) external returns (uint256 assets);

        event Deposit(address indexed sender, address indexed owner, uint256 assets, uint256 shares);
        event Withdraw(address indexed sender, address indexed receiver, address indexed owner, uint256 assets, uint256 shares);
    }

    #[sol(rpc)]
    contract IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}
